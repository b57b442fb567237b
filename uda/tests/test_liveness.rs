use std::time::Duration;

use tokio::net::TcpListener;

use uda::plugins::{PluginClass, PluginDescriptor};
use uda::{Client, RequestKind, Server};

use crate::{assert_usable, start_pair, test_environment, test_registry};

#[tokio::test]
async fn aged_out_connection_is_replaced_transparently() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Server::new(test_registry(), test_environment(port));
    tokio::spawn(server.serve(listener));

    let mut environment = test_environment(port);
    environment.timeout_secs = 3;
    let mut client = Client::with_environment(environment);
    client.registry_mut().register(
        PluginDescriptor::new("testdata", PluginClass::Function, RequestKind::FunctionLib),
        None,
    );

    let handle = client.get("", "help::ping()").await.unwrap();
    assert_usable(&client, handle);

    // Past timeout - 2s the client assumes the server self-destructed and
    // reconnects rather than reusing the stale socket.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let handle = client.get("", "help::ping()").await.unwrap();
    let block = assert_usable(&client, handle);
    assert_eq!(block.data_string().unwrap(), "pong");
}

#[tokio::test]
async fn switching_servers_parks_and_restores_connections() {
    let listener_a = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port_a = listener_a.local_addr().unwrap().port();
    tokio::spawn(Server::new(test_registry(), test_environment(port_a)).serve(listener_a));

    let listener_b = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port_b = listener_b.local_addr().unwrap().port();
    tokio::spawn(Server::new(test_registry(), test_environment(port_b)).serve(listener_b));

    let mut client = start_pair().await;
    // The start_pair client points at its own server; retarget it at A.
    client.set_server("127.0.0.1", port_a);
    let handle = client.get("", "help::ping()").await.unwrap();
    assert_usable(&client, handle);

    client.set_server("127.0.0.1", port_b);
    let handle = client.get("", "help::services()").await.unwrap();
    assert_usable(&client, handle);

    // Back to A: the parked connection is restored and still serves.
    client.set_server("127.0.0.1", port_a);
    let handle = client.get("", "help::ping()").await.unwrap();
    let block = assert_usable(&client, handle);
    assert_eq!(block.data_string().unwrap(), "pong");

    client.free_all().await;
}
