#![allow(dead_code)]

use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use p2pforwarder::{
    logging::init_test_logging,
    transport::memory::{MemoryNetwork, MemoryTransport},
    Connection, Family, Forwarder, ForwarderConfig,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn forwarder(network: &MemoryNetwork) -> Forwarder<MemoryTransport> {
    init_test_logging();
    Forwarder::new(network.transport(), ForwarderConfig::default()).unwrap()
}

/// Polls `condition` until it holds, panicking after [`WAIT_TIMEOUT`].
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let waiting = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    if tokio::time::timeout(WAIT_TIMEOUT, waiting).await.is_err() {
        panic!("Timed out waiting for {what}");
    }
}

pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(WAIT_TIMEOUT, future).await {
        Ok(output) => output,
        Err(_) => panic!("Timed out waiting for {what}"),
    }
}

/// Waits until `connection` mirrors the remote `port` and returns the local address.
pub async fn mirrored_addr(connection: &Connection, family: Family, port: u16) -> SocketAddr {
    wait_until("the port to be mirrored", || connection.local_addr(family, port).is_some()).await;
    connection.local_addr(family, port).unwrap()
}

/// Starts a TCP echo service on localhost and returns its port.
pub async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(len) => {
                            if stream.write_all(&buf[..len]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    port
}

/// Starts a UDP echo service on localhost and returns its port.
pub async fn spawn_udp_echo() -> u16 {
    let socket = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let port = socket.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((len, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], from).await;
        }
    });

    port
}
