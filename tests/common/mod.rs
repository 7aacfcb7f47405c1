//! Scripted fake server for driving the client end-to-end.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use sqlit_database::DatabaseValue;
use sqlit_database::wire::{self, MessageType, RequestBody};

pub struct ClientRequest {
    pub message_type: MessageType,
    pub flags: u16,
    pub request_id: u32,
    /// `None` for header-only PING requests.
    pub body: Option<RequestBody>,
}

/// Bind an ephemeral port and serve exactly one connection with the
/// given script.
pub async fn spawn_server<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });

    addr
}

/// Bind an ephemeral port and serve every connection with the given
/// script, counting how many connections were accepted.
pub async fn spawn_multi_server<F, Fut>(script: F) -> (SocketAddr, Arc<AtomicUsize>)
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let accepted_inner = Arc::clone(&accepted);

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            accepted_inner.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(script(stream));
        }
    });

    (addr, accepted)
}

/// Answer PING frames with PONG until the client hangs up.
pub async fn serve_pings(mut stream: TcpStream) {
    while let Ok(header) = wire::read_header(&mut stream).await {
        assert_eq!(header.message_type, MessageType::Ping as u8);
        write_pong(&mut stream, header.request_id).await;
    }
}

pub async fn read_request(stream: &mut TcpStream) -> ClientRequest {
    let header = wire::read_header(stream).await.expect("request header");
    let message_type = MessageType::try_from(header.message_type).unwrap();

    let body = if message_type == MessageType::Ping {
        None
    } else {
        let body_len = stream.read_u32_le().await.unwrap();
        let mut body = vec![0_u8; body_len as usize];
        stream.read_exact(&mut body).await.unwrap();
        Some(wire::parse_request_body(&body).unwrap())
    };

    ClientRequest {
        message_type,
        flags: header.flags,
        request_id: header.request_id,
        body,
    }
}

pub async fn write_pong(stream: &mut TcpStream, request_id: u32) {
    let header = wire::encode_header(MessageType::Pong as u8, 0, request_id);
    stream.write_all(&header).await.unwrap();
}

pub async fn write_error(stream: &mut TcpStream, request_id: u32, message: &str) {
    let mut frame = BytesMut::new();
    frame.put_slice(&wire::encode_header(MessageType::Error as u8, 0, request_id));
    frame.put_u32_le(u32::try_from(message.len()).unwrap());
    frame.put_slice(message.as_bytes());
    stream.write_all(&frame).await.unwrap();
}

pub async fn write_query_result(
    stream: &mut TcpStream,
    request_id: u32,
    columns: &[&str],
    rows: &[Vec<DatabaseValue>],
) {
    let mut frame = BytesMut::new();
    frame.put_slice(&wire::encode_header(MessageType::Result as u8, 0, request_id));
    frame.put_u8(1);
    frame.put_u8(u8::try_from(columns.len()).unwrap());
    for column in columns {
        frame.put_u32_le(u32::try_from(column.len()).unwrap());
        frame.put_slice(column.as_bytes());
    }
    frame.put_u32_le(u32::try_from(rows.len()).unwrap());
    for row in rows {
        for value in row {
            wire::encode_value(&mut frame, value).unwrap();
        }
    }
    stream.write_all(&frame).await.unwrap();
}

pub async fn write_exec_result(
    stream: &mut TcpStream,
    request_id: u32,
    last_insert_id: u64,
    rows_affected: u64,
) {
    let mut frame = BytesMut::new();
    frame.put_slice(&wire::encode_header(MessageType::Result as u8, 0, request_id));
    frame.put_u8(1);
    frame.put_u64_le(last_insert_id);
    frame.put_u64_le(rows_affected);
    stream.write_all(&frame).await.unwrap();
}

pub async fn write_begin_result(stream: &mut TcpStream, request_id: u32, transaction_id: &str) {
    let mut frame = BytesMut::new();
    frame.put_slice(&wire::encode_header(MessageType::Result as u8, 0, request_id));
    frame.put_u8(1);
    frame.put_u32_le(u32::try_from(transaction_id.len()).unwrap());
    frame.put_slice(transaction_id.as_bytes());
    stream.write_all(&frame).await.unwrap();
}

/// RESULT body for TX_COMMIT / TX_ROLLBACK: just the success flag.
pub async fn write_simple_result(stream: &mut TcpStream, request_id: u32) {
    let mut frame = BytesMut::new();
    frame.put_slice(&wire::encode_header(MessageType::Result as u8, 0, request_id));
    frame.put_u8(1);
    stream.write_all(&frame).await.unwrap();
}
