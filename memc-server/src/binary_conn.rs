//! Per-connection binary engine loop. Same shape as the text loop, but frames are
//! fixed 24-byte headers plus a declared body length rather than line-delimited.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use memc_protocol::binary;
use memc_protocol::command::Op;
use memc_store::Store;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub async fn handle(mut stream: TcpStream, store: Arc<Store>, mut read_buf: BytesMut) {
    let mut write_buf = BytesMut::new();
    let mut scratch = [0u8; 4096];

    loop {
        loop {
            match binary::parse_request(&read_buf) {
                Ok((rest, request)) => {
                    let consumed = read_buf.len() - rest.len();
                    let opcode = request.header.opcode;
                    let opaque = request.header.opaque;

                    match binary::to_command(&request) {
                        Ok(cmd) => {
                            let quitting = cmd.op == Op::Quit;
                            let response = store.execute(&cmd);
                            binary::compose_response(opcode, opaque, &response, &mut write_buf);
                            read_buf.advance(consumed);

                            if stream.write_all(&write_buf).await.is_err() {
                                return;
                            }
                            write_buf.clear();

                            if quitting {
                                let _ = stream.shutdown().await;
                                return;
                            }
                        }
                        Err(status) => {
                            binary::compose_status(opcode, opaque, status, &mut write_buf);
                            read_buf.advance(consumed);
                            if stream.write_all(&write_buf).await.is_err() {
                                return;
                            }
                            write_buf.clear();
                        }
                    }
                }
                Err(e) if e.is_incomplete() => break,
                Err(_) => return,
            }
        }

        match stream.read(&mut scratch).await {
            Ok(0) => return,
            Ok(n) => read_buf.extend_from_slice(&scratch[..n]),
            Err(e) => {
                debug!(error = %e, "binary connection read failed");
                return;
            }
        }
    }
}
