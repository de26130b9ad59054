mod common;

use std::net::{IpAddr, Ipv4Addr};

use common::{forwarder, mirrored_addr, spawn_tcp_echo, spawn_udp_echo, wait_until, within, LOCALHOST};
use p2pforwarder::{transport::memory::MemoryNetwork, Family, ForwarderError, Transport};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_connection_is_tunneled_to_the_exposed_port() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);
    let client = forwarder(&network);

    let echo_port = spawn_tcp_echo().await;
    let _handle = exposer.open_port(Family::Tcp, echo_port).unwrap();

    let connection = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();
    assert_eq!(connection.peer(), exposer.id());
    assert!(client.is_connected(exposer.id()));

    // The echo service already holds the exact port on this address.
    let local_addr = mirrored_addr(&connection, Family::Tcp, echo_port).await;
    assert_eq!(local_addr.ip(), LOCALHOST);
    assert_ne!(local_addr.port(), echo_port);

    let mut stream = TcpStream::connect(local_addr).await.unwrap();
    stream.write_all(b"hello through the tunnel").await.unwrap();

    let mut buf = [0u8; 24];
    within("the echo", stream.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");

    let forwarded = connection.bound_ports();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].family, Family::Tcp);
    assert_eq!(forwarded[0].remote_port, echo_port);
    assert_eq!(forwarded[0].local_addr, local_addr);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_datagrams_are_tunneled_to_the_exposed_port() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);
    let client = forwarder(&network);

    let echo_port = spawn_udp_echo().await;
    let _handle = exposer.open_port(Family::Udp, echo_port).unwrap();

    let connection = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();
    let local_addr = mirrored_addr(&connection, Family::Udp, echo_port).await;
    assert!(connection.local_addr(Family::Tcp, echo_port).is_none());

    let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    socket.connect(local_addr).await.unwrap();

    for message in [&b"first"[..], &b"second datagram"[..]] {
        socket.send(message).await.unwrap();
        let mut buf = [0u8; 64];
        let len = within("the echoed datagram", socket.recv(&mut buf)).await.unwrap();
        assert_eq!(&buf[..len], message);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_the_port_ends_tunnels_and_listeners() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);
    let client = forwarder(&network);

    let echo_port = spawn_tcp_echo().await;
    let handle = exposer.open_port(Family::Tcp, echo_port).unwrap();

    let connection = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();
    let local_addr = mirrored_addr(&connection, Family::Tcp, echo_port).await;

    let mut stream = TcpStream::connect(local_addr).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    within("the echo", stream.read_exact(&mut buf)).await.unwrap();

    handle.cancel();
    assert!(!handle.is_open());
    assert!(exposer.open_ports().is_empty());

    // The tunnel ends, either cleanly or with a reset.
    let mut rest = Vec::new();
    let ended = within("the tunnel to end", stream.read_to_end(&mut rest)).await;
    assert!(ended.is_err() || rest.is_empty());

    wait_until("the listener to close", || connection.bound_ports().is_empty()).await;
    assert!(TcpStream::connect(local_addr).await.is_err());
    assert!(!connection.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopened_port_is_mirrored_again() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);
    let client = forwarder(&network);

    let echo_port = spawn_tcp_echo().await;
    let connection = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();

    let first = exposer.open_port(Family::Tcp, echo_port).unwrap();
    mirrored_addr(&connection, Family::Tcp, echo_port).await;

    first.cancel();
    wait_until("the listener to close", || connection.bound_ports().is_empty()).await;

    let second = exposer.open_port(Family::Tcp, echo_port).unwrap();
    let local_addr = mirrored_addr(&connection, Family::Tcp, echo_port).await;

    // A stale handle doesn't close the reopened port.
    first.cancel();
    assert!(second.is_open());

    let mut stream = TcpStream::connect(local_addr).await.unwrap();
    stream.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    within("the echo", stream.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opening_a_port_twice_fails() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);

    let _handle = exposer.open_port(Family::Tcp, 4000).unwrap();
    assert!(matches!(
        exposer.open_port(Family::Tcp, 4000),
        Err(ForwarderError::AlreadyOpen { family: Family::Tcp, port: 4000 })
    ));

    let _udp = exposer.open_port(Family::Udp, 4000).unwrap();
    assert!(matches!(exposer.open_port_named("sctp", 4000), Err(ForwarderError::UnknownFamily(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connecting_twice_to_the_same_peer_fails() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);
    let client = forwarder(&network);

    let first = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();
    match client.connect(exposer.id(), Some(LOCALHOST)).await {
        Err(ForwarderError::AlreadyConnected(peer)) => assert_eq!(peer, exposer.id()),
        other => panic!("unexpected result {other:?}"),
    }

    first.cancel();
    assert!(!client.is_connected(exposer.id()));
    let _second = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();
    assert!(client.is_connected(exposer.id()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_connection_closes_its_listeners() {
    let network = MemoryNetwork::new();
    let exposer = forwarder(&network);
    let client = forwarder(&network);

    let echo_port = spawn_tcp_echo().await;
    let _handle = exposer.open_port(Family::Tcp, echo_port).unwrap();

    let connection = client.connect(exposer.id(), Some(LOCALHOST)).await.unwrap();
    let local_addr = mirrored_addr(&connection, Family::Tcp, echo_port).await;

    let mut stream = TcpStream::connect(local_addr).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    within("the echo", stream.read_exact(&mut buf)).await.unwrap();

    assert!(client.disconnect(exposer.id()));
    assert!(!client.disconnect(exposer.id()));

    let mut rest = Vec::new();
    let ended = within("the tunnel to end", stream.read_to_end(&mut rest)).await;
    assert!(ended.is_err() || rest.is_empty());

    wait_until("the listeners to close", || connection.bound_ports().is_empty()).await;
    assert!(TcpStream::connect(local_addr).await.is_err());
    assert!(connection.is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connecting_to_an_unknown_peer_fails() {
    let network = MemoryNetwork::new();
    let client = forwarder(&network);
    let peer = network.transport().local_peer_id();
    network.remove(peer);

    assert!(matches!(client.connect(peer, None).await, Err(ForwarderError::Io(_))));
    assert!(!client.is_connected(peer));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connections_get_distinct_forwarding_ips() {
    let network = MemoryNetwork::new();
    let client = forwarder(&network);
    let first_peer = forwarder(&network);
    let second_peer = forwarder(&network);

    let first = client.connect(first_peer.id(), None).await.unwrap();
    let second = client.connect(second_peer.id(), None).await.unwrap();

    for connection in [&first, &second] {
        match connection.listen_ip() {
            IpAddr::V4(ip) => assert_eq!(ip.octets()[..3], [127, 0, 89]),
            other => panic!("unexpected listen ip {other}"),
        }
    }
    assert_ne!(first.listen_ip(), second.listen_ip());

    let custom = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 7));
    let third_peer = forwarder(&network);
    let third = client.connect(third_peer.id(), Some(custom)).await.unwrap();
    assert_eq!(third.listen_ip(), custom);
}
