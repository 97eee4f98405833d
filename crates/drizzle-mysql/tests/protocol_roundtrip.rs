//! End-to-end protocol tests against a scripted in-process server.
//!
//! Each test spins up a loopback listener that speaks just enough of the
//! server side of the protocol to drive one scenario: greeting, auth,
//! the connect-time variable probe, then the scripted exchange.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use drizzle_core::error::QueryErrorKind;
use drizzle_mysql::auth::{caching_sha2_scramble, native_scramble};
use drizzle_mysql::protocol::PacketWriter;
use drizzle_mysql::query::{Batch, Query};
use drizzle_mysql::{Error, MySqlConfig, MySqlConnection, QueryResult, Value};

const SEED: [u8; 20] = *b"abcdefghijklmnopqrst";
const PASSWORD: &str = "testpass";

// Capability bits the scripted server advertises
const CAPS: u32 = 1 // LONG_PASSWORD
    | (1 << 1) // FOUND_ROWS
    | (1 << 3) // CONNECT_WITH_DB
    | (1 << 9) // PROTOCOL_41
    | (1 << 13) // TRANSACTIONS
    | (1 << 15) // SECURE_CONNECTION
    | (1 << 16) // MULTI_STATEMENTS
    | (1 << 17) // MULTI_RESULTS
    | (1 << 19); // PLUGIN_AUTH

const MORE_RESULTS: u16 = 0x0008;

fn spawn_server<F>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpListener) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || script(listener));
    (addr, handle)
}

fn test_config(addr: SocketAddr) -> MySqlConfig {
    MySqlConfig::new()
        .host(addr.ip().to_string())
        .port(addr.port())
        .user("app")
        .password(PASSWORD)
        .connect_timeout(Duration::from_secs(5))
}

fn read_packet(stream: &mut TcpStream) -> (Vec<u8>, u8) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let len =
        usize::from(header[0]) | (usize::from(header[1]) << 8) | (usize::from(header[2]) << 16);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (payload, header[3])
}

fn write_packet(stream: &mut TcpStream, payload: &[u8], seq: u8) {
    let framed = [
        &[
            (payload.len() & 0xFF) as u8,
            ((payload.len() >> 8) & 0xFF) as u8,
            ((payload.len() >> 16) & 0xFF) as u8,
            seq,
        ],
        payload,
    ]
    .concat();
    stream.write_all(&framed).unwrap();
}

fn greeting_payload(plugin: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string("8.0.33-scripted");
    w.write_u32_le(99); // thread id
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le((CAPS & 0xFFFF) as u16);
    w.write_u8(33);
    w.write_u16_le(0x0002);
    w.write_u16_le((CAPS >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

fn ok_payload(affected: u8, insert_id: u8, status: u16) -> Vec<u8> {
    vec![
        0x00,
        affected,
        insert_id,
        (status & 0xFF) as u8,
        (status >> 8) as u8,
        0,
        0,
    ]
}

fn err_payload(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut payload = vec![0xFF, (code & 0xFF) as u8, (code >> 8) as u8, b'#'];
    payload.extend_from_slice(state.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    payload
}

fn eof_payload(status: u16) -> Vec<u8> {
    vec![0xFE, 0, 0, (status & 0xFF) as u8, (status >> 8) as u8]
}

fn column_payload(name: &str, type_code: u8) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for part in ["def", "db", "t", "t", name, name] {
        w.write_lenenc_string(part);
    }
    w.write_lenenc_int(0x0C);
    w.write_u16_le(33);
    w.write_u32_le(64);
    w.write_u8(type_code);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

fn row_payload(cells: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for cell in cells {
        match cell {
            Some(text) => w.write_lenenc_string(text),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

/// Send a full result set: column count, definitions, EOF, rows, EOF.
fn send_row_set(
    stream: &mut TcpStream,
    columns: &[(&str, u8)],
    rows: &[&[Option<&str>]],
    final_status: u16,
) {
    let mut seq = 1;
    write_packet(stream, &[columns.len() as u8], seq);
    for (name, type_code) in columns {
        seq += 1;
        write_packet(stream, &column_payload(name, *type_code), seq);
    }
    seq += 1;
    write_packet(stream, &eof_payload(0), seq);
    for row in rows {
        seq += 1;
        write_packet(stream, &row_payload(row), seq);
    }
    write_packet(stream, &eof_payload(final_status), seq + 1);
}

/// Greeting, native auth, the max_allowed_packet probe.
fn establish(stream: &mut TcpStream) {
    establish_with_limit(stream, "16777215");
}

fn establish_with_limit(stream: &mut TcpStream, max_allowed_packet: &str) {
    write_packet(stream, &greeting_payload("mysql_native_password"), 0);

    let (auth, seq) = read_packet(stream);
    assert_eq!(seq, 1);
    // NUL-terminated user starts after caps, max packet, charset, 23 zeros
    assert_eq!(&auth[32..36], b"app\0");
    let expected = native_scramble(PASSWORD, &SEED);
    assert_eq!(auth[36] as usize, expected.len());
    assert_eq!(&auth[37..37 + expected.len()], &expected[..]);

    write_packet(stream, &ok_payload(0, 0, 2), 2);
    serve_probe(stream, max_allowed_packet);
}

fn serve_probe(stream: &mut TcpStream, value: &str) {
    let (query, _) = read_packet(stream);
    assert_eq!(query[0], 0x03);
    assert_eq!(&query[1..], b"select @@max_allowed_packet");
    send_row_set(stream, &[("@@max_allowed_packet", 0xFD)], &[&[Some(value)]], 0);
}

#[test]
fn connect_reports_server_state() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);
        // COM_QUIT from close()
        let (quit, _) = read_packet(&mut stream);
        assert_eq!(quit, vec![0x01]);
    });

    let conn = MySqlConnection::connect(test_config(addr)).unwrap();
    assert!(conn.is_ready());
    assert_eq!(conn.thread_id(), 99);
    assert_eq!(conn.server_version(), "8.0.33-scripted");
    assert_eq!(conn.max_allowed_packet(), 16_777_215);
    conn.close().unwrap();

    server.join().unwrap();
}

#[test]
fn update_returns_affected_rows() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);

        let (query, seq) = read_packet(&mut stream);
        assert_eq!(seq, 0);
        assert_eq!(&query[1..], b"INSERT INTO t (x) VALUES (7)");
        write_packet(&mut stream, &ok_payload(1, 5, 2), 1);
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    let result = conn
        .execute_query("INSERT INTO t (x) VALUES (7)")
        .unwrap();
    assert_eq!(result.affected_rows(), 1);
    assert_eq!(result.insert_id(), 5);

    drop(conn);
    server.join().unwrap();
}

#[test]
fn select_decodes_rows_and_nulls() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);

        let _ = read_packet(&mut stream);
        send_row_set(
            &mut stream,
            &[("id", 0x03), ("name", 0xFD)],
            &[&[Some("1"), Some("Alice")], &[Some("2"), None]],
            0,
        );
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    let result = conn.execute_query("SELECT id, name FROM users").unwrap();

    let QueryResult::Rows(set) = result else {
        panic!("expected a row set");
    };
    assert_eq!(set.len(), 2);
    assert_eq!(set.rows[0].get_by_name("id"), Some(&Value::Int(1)));
    assert_eq!(
        set.rows[0].get_by_name("name"),
        Some(&Value::Text("Alice".into()))
    );
    assert_eq!(set.rows[1].get_by_name("name"), Some(&Value::Null));

    drop(conn);
    server.join().unwrap();
}

#[test]
fn server_error_carries_code_and_state() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);

        let _ = read_packet(&mut stream);
        write_packet(
            &mut stream,
            &err_payload(1064, "42000", "You have an error in your SQL syntax"),
            1,
        );
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    let err = conn.execute_query("SELEC 1").unwrap_err();
    assert_eq!(err.server_code(), Some(1064));
    assert_eq!(err.sqlstate(), Some("42000"));

    drop(conn);
    server.join().unwrap();
}

#[test]
fn auth_switch_reissues_credential() {
    let new_seed = *b"ZYXWVUTSRQPONMLKJIHG";

    let (addr, server) = spawn_server(move |listener| {
        let (mut stream, _) = listener.accept().unwrap();
        write_packet(&mut stream, &greeting_payload("mysql_native_password"), 0);
        let _ = read_packet(&mut stream);

        // Demand a fresh native scramble over a new seed
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_native_password\0");
        switch.extend_from_slice(&new_seed);
        switch.push(0);
        write_packet(&mut stream, &switch, 2);

        let (response, _) = read_packet(&mut stream);
        assert_eq!(response, native_scramble(PASSWORD, &new_seed));

        write_packet(&mut stream, &ok_payload(0, 0, 2), 4);
        serve_probe(&mut stream, "16777215");
    });

    let conn = MySqlConnection::connect(test_config(addr)).unwrap();
    assert!(conn.is_ready());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn caching_sha2_fast_auth() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        write_packet(&mut stream, &greeting_payload("caching_sha2_password"), 0);

        let (auth, _) = read_packet(&mut stream);
        let expected = caching_sha2_scramble(PASSWORD, &SEED);
        assert_eq!(auth[36] as usize, expected.len());
        assert_eq!(&auth[37..37 + expected.len()], &expected[..]);

        // Fast auth accepted, then the final OK
        write_packet(&mut stream, &[0x01, 0x03], 2);
        write_packet(&mut stream, &ok_payload(0, 0, 2), 3);
        serve_probe(&mut stream, "16777215");
    });

    let conn = MySqlConnection::connect(test_config(addr)).unwrap();
    assert!(conn.is_ready());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn batch_reads_one_result_per_statement() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);

        let (payload, _) = read_packet(&mut stream);
        assert_eq!(payload[0], 0x03);
        assert_eq!(&payload[1..], b"SELECT 1;INSERT INTO t VALUES (2)");

        // First result flags more to come, second ends the exchange
        write_packet(&mut stream, &ok_payload(0, 0, MORE_RESULTS), 1);
        write_packet(&mut stream, &ok_payload(1, 9, 2), 2);
    });

    let config = test_config(addr).allow_multi_queries(true);
    let mut conn = MySqlConnection::connect(config).unwrap();

    let mut batch = Batch::new();
    batch.add(Query::new("SELECT 1"));
    batch.add(Query::new("INSERT INTO t VALUES (2)"));

    let results = conn.execute_batch(&mut batch).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1].insert_id(), 9);
    assert!(batch.is_empty());
    assert!(!conn.has_more_results());

    drop(conn);
    server.join().unwrap();
}

#[test]
fn batch_requires_multi_queries_enabled() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    let mut batch = Batch::new();
    batch.add(Query::new("SELECT 1"));

    let err = conn.execute_batch(&mut batch).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));

    drop(conn);
    server.join().unwrap();
}

#[test]
fn oversized_query_rejected_locally() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        // The server advertises a tiny payload limit
        establish_with_limit(&mut stream, "64");
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    assert_eq!(conn.max_allowed_packet(), 64);

    let sql = format!("SELECT '{}'", "x".repeat(100));
    let err = conn.execute_query(&sql).unwrap_err();
    match err {
        Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::PacketTooLarge),
        other => panic!("expected a query error, got {other}"),
    }

    drop(conn);
    server.join().unwrap();
}

#[test]
fn ping_round_trip() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);

        let (payload, seq) = read_packet(&mut stream);
        assert_eq!(payload, vec![0x0e]);
        assert_eq!(seq, 0);
        write_packet(&mut stream, &ok_payload(0, 0, 2), 1);
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    conn.ping().unwrap();

    drop(conn);
    server.join().unwrap();
}

#[test]
fn query_may_outlive_connect_timeout() {
    let (addr, server) = spawn_server(|listener| {
        let (mut stream, _) = listener.accept().unwrap();
        establish(&mut stream);

        let (query, _) = read_packet(&mut stream);
        assert_eq!(&query[1..], b"SELECT SLEEP(1)");
        // Answer well after the connect deadline has passed
        thread::sleep(Duration::from_millis(900));
        write_packet(&mut stream, &ok_payload(0, 0, 2), 1);
    });

    // The connect deadline governs the handshake only; a slow but valid
    // query must not surface as a lost connection
    let config = test_config(addr).connect_timeout(Duration::from_millis(300));
    let mut conn = MySqlConnection::connect(config).unwrap();
    conn.execute_query("SELECT SLEEP(1)").unwrap();

    drop(conn);
    server.join().unwrap();
}

#[test]
fn cancelled_query_surfaces_as_cancelled() {
    let (addr, server) = spawn_server(|listener| {
        // The query connection
        let (mut victim, _) = listener.accept().unwrap();
        establish(&mut victim);
        let (query, _) = read_packet(&mut victim);
        assert_eq!(&query[1..], b"SELECT SLEEP(10)");

        // The kill connection opened by the cancel handle
        let (mut killer, _) = listener.accept().unwrap();
        establish(&mut killer);
        let (kill, _) = read_packet(&mut killer);
        assert_eq!(&kill[1..], b"KILL QUERY 99");
        write_packet(&mut killer, &ok_payload(0, 0, 2), 1);
        let _ = read_packet(&mut killer); // COM_QUIT

        // The interrupted query fails server-side
        write_packet(
            &mut victim,
            &err_payload(1317, "70100", "Query execution was interrupted"),
            1,
        );
    });

    let mut conn = MySqlConnection::connect(test_config(addr)).unwrap();
    let handle = conn.cancel_handle();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        handle.cancel().unwrap();
    });

    let err = conn.execute_query("SELECT SLEEP(10)").unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    canceller.join().unwrap();
    drop(conn);
    server.join().unwrap();
}
