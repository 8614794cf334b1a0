//! End-to-end dispatcher scenarios, driven over an in-process
//! duplex pipe instead of a real socket.

use std::sync::Arc;

use grafdoor::db::memory::{MemoryStorage, StaticAuth, StaticUser};
use grafdoor::db::record::{Rid, RecordVersion};
use grafdoor::db::Database;
use grafdoor::dispatcher::{Dispatcher, DispatcherConfig};
use grafdoor::wire::envelope::{
    OP_DB_CLOSE, OP_DB_OPEN, OP_RECORD_CLEAN_OUT, OP_RECORD_CREATE, OP_RECORD_LOAD,
    OP_RECORD_METADATA, OP_RECORD_UPDATE, OP_TX_COMMIT, STATUS_ERROR, STATUS_OK,
};
use grafdoor::wire::frame::{
    read_byte, read_bytes, read_int, read_long, read_rid, read_short, read_string, read_version,
    write_byte, write_bytes, write_int, write_rid, write_short, write_string, write_version,
};

/// The protocol version every test negotiates at `CONNECT`; high enough
/// that every `proto >= X` wire branch this crate implements is active
/// except `RECORD_CREATE`'s `10 <= proto < 24` `dataSegmentId`, which is
/// deliberately exercised as absent.
const PROTOCOL_VERSION: i16 = 24;

fn dispatcher() -> Arc<Dispatcher<MemoryStorage, StaticAuth>> {
    let storage = Arc::new(MemoryStorage::new(vec![9]));
    let auth = Arc::new(StaticAuth::new(vec![StaticUser {
        username: "admin".to_string(),
        password: "admin".to_string(),
        is_admin: true,
    }]));
    let db = Arc::new(Database::new("demo", storage, 64, true));
    Arc::new(Dispatcher::new(db, auth, DispatcherConfig::default()))
}

async fn handshake(client: &mut tokio::io::DuplexStream) -> i32 {
    let _server_version = read_short(client).await.unwrap();

    write_byte(client, grafdoor::wire::envelope::OP_CONNECT)
        .await
        .unwrap();
    write_int(client, -1).await.unwrap();
    write_string(client, Some("test-driver")).await.unwrap();
    write_string(client, Some("1.0")).await.unwrap();
    write_short(client, PROTOCOL_VERSION).await.unwrap();
    write_string(client, Some("test-client")).await.unwrap();
    write_string(client, Some("admin")).await.unwrap();
    write_string(client, Some("admin")).await.unwrap();

    let status = read_byte(client).await.unwrap();
    assert_eq!(status, STATUS_OK);
    read_int(client).await.unwrap()
}

async fn open_database(client: &mut tokio::io::DuplexStream, session_id: i32) {
    write_byte(client, OP_DB_OPEN).await.unwrap();
    write_int(client, session_id).await.unwrap();
    write_string(client, Some("orient-binary")).await.unwrap(); // serializer, proto>21
    write_string(client, Some("demo")).await.unwrap();
    write_string(client, Some("graph")).await.unwrap(); // dbType, proto>=8
    write_string(client, Some("admin")).await.unwrap();
    write_string(client, Some("admin")).await.unwrap();

    assert_eq!(read_byte(client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(client).await.unwrap(), session_id);
    let _cluster_count = read_int(client).await.unwrap();
    let _server_version = read_string(client).await.unwrap(); // proto>=14
}

/// `RECORD_CREATE` round trip: writes the request (cluster id plus the
/// sentinel, not-yet-assigned position) and reads back the assigned
/// `clusterPosition`/version, reassembling the full `Rid` the caller needs
/// for follow-up requests.
async fn create_record(
    client: &mut tokio::io::DuplexStream,
    session_id: i32,
    cluster_id: i16,
    content: &[u8],
) -> (Rid, RecordVersion) {
    write_byte(client, OP_RECORD_CREATE).await.unwrap();
    write_int(client, session_id).await.unwrap();
    write_rid(client, Rid::new(cluster_id, -1)).await.unwrap();
    write_bytes(client, Some(content)).await.unwrap();
    write_byte(client, 1).await.unwrap();
    write_byte(client, 0).await.unwrap();

    assert_eq!(read_byte(client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(client).await.unwrap(), session_id);
    let position = read_long(client).await.unwrap();
    let version = read_version(client).await.unwrap();
    (Rid::new(cluster_id, position), version)
}

#[tokio::test]
async fn connect_open_create_and_load_round_trip() {
    let dispatcher = dispatcher();
    let (mut client, server) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let session_id = handshake(&mut client).await;
    open_database(&mut client, session_id).await;

    let (created_rid, created_version) =
        create_record(&mut client, session_id, 9, br#"{"hello":"world"}"#).await;
    assert_eq!(created_version, RecordVersion::Tracked(1));

    write_byte(&mut client, OP_RECORD_LOAD).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    write_rid(&mut client, created_rid).await.unwrap();
    write_string(&mut client, None).await.unwrap();
    write_byte(&mut client, 0).await.unwrap();
    write_byte(&mut client, 0).await.unwrap();

    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    assert_eq!(read_byte(&mut client).await.unwrap(), 1);
    let bytes = read_bytes(&mut client).await.unwrap().unwrap();
    assert_eq!(bytes, br#"{"hello":"world"}"#);
    let loaded_version = read_version(&mut client).await.unwrap();
    assert_eq!(loaded_version, created_version);
    let _record_type = read_byte(&mut client).await.unwrap();
    assert_eq!(read_byte(&mut client).await.unwrap(), 0); // no side records

    write_byte(&mut client, OP_DB_CLOSE).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_OK);

    drop(client);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_version_update_surfaces_mvcc_conflict() {
    let dispatcher = dispatcher();
    let (mut client, server) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let session_id = handshake(&mut client).await;
    open_database(&mut client, session_id).await;

    let (rid, _version) = create_record(&mut client, session_id, 9, b"{}").await;

    write_byte(&mut client, OP_RECORD_UPDATE).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    write_rid(&mut client, rid).await.unwrap();
    write_byte(&mut client, 1).await.unwrap(); // updateContent, proto>=23
    write_bytes(&mut client, Some(b"{\"v\":2}")).await.unwrap();
    write_version(&mut client, RecordVersion::Tracked(99))
        .await
        .unwrap();
    write_byte(&mut client, 1).await.unwrap(); // record type
    write_byte(&mut client, 0).await.unwrap(); // mode

    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_ERROR);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    assert_eq!(read_byte(&mut client).await.unwrap(), 1);
    let class_name = read_string(&mut client).await.unwrap().unwrap();
    assert_eq!(class_name, "OConcurrentModificationException");
    let _message = read_string(&mut client).await.unwrap();
    assert_eq!(read_byte(&mut client).await.unwrap(), 0);

    drop(client);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn tx_commit_reports_created_identity_mapping() {
    let dispatcher = dispatcher();
    let (mut client, server) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let session_id = handshake(&mut client).await;
    open_database(&mut client, session_id).await;

    write_byte(&mut client, OP_TX_COMMIT).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    write_int(&mut client, 1).await.unwrap();
    write_byte(&mut client, 1).await.unwrap(); // create
    write_short(&mut client, 9).await.unwrap();
    write_byte(&mut client, 1).await.unwrap();
    write_bytes(&mut client, Some(b"{}")).await.unwrap();

    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    let created_count = read_int(&mut client).await.unwrap();
    assert_eq!(created_count, 1);
    let _client_rid = read_rid(&mut client).await.unwrap();
    let _server_rid = read_rid(&mut client).await.unwrap();
    let updated_count = read_int(&mut client).await.unwrap();
    assert_eq!(updated_count, 0);

    drop(client);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn record_metadata_returns_identity_and_version_without_bytes() {
    let dispatcher = dispatcher();
    let (mut client, server) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let session_id = handshake(&mut client).await;
    open_database(&mut client, session_id).await;

    let (rid, version) = create_record(&mut client, session_id, 9, b"{\"k\":1}").await;

    write_byte(&mut client, OP_RECORD_METADATA).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    write_rid(&mut client, rid).await.unwrap();

    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    assert_eq!(read_byte(&mut client).await.unwrap(), 1);
    let metadata_rid = read_rid(&mut client).await.unwrap();
    assert_eq!(metadata_rid, rid);
    let metadata_version = read_version(&mut client).await.unwrap();
    assert_eq!(metadata_version, version);
    let _record_type = read_byte(&mut client).await.unwrap();

    drop(client);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn record_clean_out_removes_the_record_without_a_tombstone() {
    let dispatcher = dispatcher();
    let (mut client, server) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let session_id = handshake(&mut client).await;
    open_database(&mut client, session_id).await;

    let (rid, version) = create_record(&mut client, session_id, 9, b"{}").await;

    write_byte(&mut client, OP_RECORD_CLEAN_OUT).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    write_rid(&mut client, rid).await.unwrap();
    write_version(&mut client, version).await.unwrap();

    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    assert_eq!(read_byte(&mut client).await.unwrap(), 1);

    write_byte(&mut client, OP_RECORD_METADATA).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();
    write_rid(&mut client, rid).await.unwrap();
    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_OK);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    assert_eq!(read_byte(&mut client).await.unwrap(), 0);

    drop(client);
    let _ = handle.await.unwrap();
}

#[tokio::test]
async fn unknown_opcode_gets_an_error_frame_and_keeps_the_session() {
    let dispatcher = dispatcher();
    let (mut client, server) = tokio::io::duplex(4096);
    let handle = tokio::spawn(async move { dispatcher.handle_connection(server).await });

    let session_id = handshake(&mut client).await;

    write_byte(&mut client, 253).await.unwrap();
    write_int(&mut client, session_id).await.unwrap();

    assert_eq!(read_byte(&mut client).await.unwrap(), STATUS_ERROR);
    assert_eq!(read_int(&mut client).await.unwrap(), session_id);
    assert_eq!(read_byte(&mut client).await.unwrap(), 1);
    let class_name = read_string(&mut client).await.unwrap().unwrap();
    assert_eq!(class_name, "CommandNotSupportedException");

    // Session still works after an unknown opcode.
    open_database(&mut client, session_id).await;

    drop(client);
    let _ = handle.await.unwrap();
}
