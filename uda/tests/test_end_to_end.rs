use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use uda::{Client, ErrorKind, OpaqueBlock, PutDataBlock, PutDataBlockList, UdaError};

use crate::{assert_usable, start_pair, test_environment};

#[tokio::test]
async fn ping_and_services_share_one_connection() {
    let mut client = start_pair().await;

    let handle = client.get("", "help::ping()").await.unwrap();
    assert_eq!(handle, 0);
    let block = assert_usable(&client, handle);
    assert_eq!(block.data_string().unwrap(), "pong");

    // Second request rides the same sleeping connection.
    let handle = client.get("", "help::services()").await.unwrap();
    assert_eq!(handle, 1);
    let block = assert_usable(&client, handle);
    assert!(block.data_string().unwrap().contains("registered plugins"));
}

#[tokio::test]
async fn ranked_profile_arrives_with_compressed_dimension() {
    let mut client = start_pair().await;

    let handle = client.get("", "testdata::profile(n=6)").await.unwrap();
    let block = assert_usable(&client, handle);
    assert_eq!(block.rank, 1);
    assert_eq!(block.data_n, 6);
    assert_eq!(
        block.data_f32().unwrap(),
        vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5]
    );
    assert_eq!(block.dims[0].n, 6);
    let coords = block.dims[0].values().unwrap();
    assert!((coords[5] - 0.005).abs() < 1e-12);
    assert_eq!(client.rank_of(handle).unwrap(), 1);
    assert_eq!(client.units_of(handle).unwrap(), "keV");
    assert_eq!(client.status_of(handle).unwrap(), 1);
}

#[tokio::test]
async fn server_side_failure_keeps_the_connection_alive() {
    let mut client = start_pair().await;

    let handle = client.get("", "testdata::fail()").await.unwrap();
    let (code, message) = client.error_of(handle).unwrap();
    assert_eq!(code, 42);
    assert!(message.contains("deliberate failure"));
    assert!(!client.error_stack().is_empty());

    // The socket survived the failure: the next request succeeds on it.
    let handle = client.get("", "help::ping()").await.unwrap();
    let block = assert_usable(&client, handle);
    assert_eq!(block.data_string().unwrap(), "pong");
}

#[tokio::test]
async fn metadata_sidecars_arrive_in_order_when_requested() {
    let mut client = start_pair().await;
    client.set_property("get_meta", "true").unwrap();

    let handle = client.get("", "testdata::profile(n=3)").await.unwrap();
    let block = assert_usable(&client, handle);
    let metadata = block.metadata.expect("metadata requested");
    assert_eq!(metadata.signal_desc.signal_name, "");
    assert_eq!(metadata.data_source.format, "testdata");
    assert_eq!(metadata.signal_rec.status, 1);
}

#[tokio::test]
async fn compound_geometry_round_trips_with_pointers() {
    let mut client = start_pair().await;

    let handle = client.get("", "testdata::geometry()").await.unwrap();
    let block = assert_usable(&client, handle);
    let OpaqueBlock::Structures(tree) = &block.opaque else {
        panic!("expected a compound payload, got {:?}", block.opaque);
    };
    assert_eq!(tree.nodes.len(), 2);
    let root = tree.node(tree.root).unwrap();
    let next = tree.deref(&root.fields[1]).unwrap().unwrap();
    assert!(tree.deref(&next.fields[1]).unwrap().is_none());
    assert_eq!(tree.alloc_log.len(), 2);
}

#[tokio::test]
async fn put_payload_reaches_the_plugin() {
    let mut client = start_pair().await;

    let mut list = PutDataBlockList::default();
    for name in ["first", "second"] {
        list.blocks.push(PutDataBlock {
            name: name.to_string(),
            data_type: uda::AtomicType::F64,
            rank: 1,
            shape: vec![2],
            count: 2,
            data: [1.0f64, 2.0].iter().flat_map(|v| v.to_be_bytes()).collect(),
        });
    }
    let handle = client.put("testdata::store()", list).await.unwrap();
    let block = assert_usable(&client, handle);
    assert_eq!(block.data_i32().unwrap(), vec![2]);
}

#[tokio::test]
async fn handle_slots_are_reused_after_free() {
    let mut client = start_pair().await;

    let first = client.get("", "help::ping()").await.unwrap();
    let second = client.get("", "help::ping()").await.unwrap();
    assert_eq!((first, second), (0, 1));
    client.free(first);
    assert!(matches!(
        client.block(first),
        Err(UdaError::MissingHandle(0))
    ));
    let third = client.get("", "help::ping()").await.unwrap();
    assert_eq!(third, first);
}

#[tokio::test]
async fn parser_errors_never_touch_the_connection() {
    let mut client = start_pair().await;
    let err = client.get("", "/bad/path(with)/parens").await.unwrap_err();
    assert!(matches!(err, UdaError::Request(_)));
    // No connection was opened or harmed.
    let handle = client.get("", "help::ping()").await.unwrap();
    assert_usable(&client, handle);
}

#[tokio::test]
async fn garbage_from_the_peer_is_a_fatal_protocol_error() {
    // A fake server that answers the startup record with framed nonsense.
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        // One complete record whose payload is not a SERVER_BLOCK.
        let payload = [0xFFu8; 16];
        let header = (payload.len() as u32) | 0x8000_0000;
        stream.write_all(&header.to_be_bytes()).await.unwrap();
        stream.write_all(&payload).await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut client = Client::with_environment(test_environment(port));
    let err = client.get("", "help::ping()").await.unwrap_err();
    assert!(matches!(err, UdaError::Protocol(_)), "got: {err}");
}

#[tokio::test]
async fn unknown_signal_for_unimplemented_plugin_reports_through_the_stack() {
    let mut client = start_pair().await;
    // netcdf is registered as a format but has no reader loaded in tests.
    let handle = client.get("/x", "netcdf::/tmp/none.nc").await.unwrap();
    let (code, message) = client.error_of(handle).unwrap();
    assert_eq!(code, 999);
    assert!(message.contains("no implementation"));
}

#[tokio::test]
async fn generic_shot_request_reports_through_the_stack() {
    let mut client = start_pair().await;
    // A pulse-number source selects the generic catalog, which is registered
    // but has no backing database in tests.
    let handle = client.get("ip", "12345").await.unwrap();
    let (code, message) = client.error_of(handle).unwrap();
    assert_eq!(code, 999);
    assert!(
        message.contains("plugin 'generic' has no implementation loaded"),
        "got: {message}"
    );

    let top = &client.error_stack().records()[0];
    assert_eq!(top.kind, ErrorKind::Plugin);
    assert_eq!(top.code, 999);

    // The failure was server-side: the connection survives it.
    let handle = client.get("", "help::ping()").await.unwrap();
    assert_usable(&client, handle);
}
