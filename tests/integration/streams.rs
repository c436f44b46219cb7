//! Reliable streams across forwarding nodes.

use anyhow::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use strand_core::wire::ConnType;
use strand_net::NetError;

use crate::*;

/// A 256 KiB payload is echoed intact through a middle node.
#[tokio::test]
async fn test_stream_echo_across_chain() -> Result<()> {
    let nodes = chain(&["t-a", "t-b", "t-c"]).await?;
    let (a, c) = (&nodes[0], &nodes[2]);

    let listener = c.listen_and_advertise("echo", Default::default())?;
    let server = tokio::spawn(async move {
        let mut conn = listener.accept().await?;
        assert_eq!(conn.peer_addr().node, "t-a");
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = conn.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            conn.write_all(&buf[..n]).await?;
        }
        conn.shutdown().await?;
        anyhow::Ok(listener)
    });

    wait_for("echo advertisement at t-a", || {
        a.get_service_info("t-c", "echo")
            .is_some_and(|ad| ad.conn_type == ConnType::Stream)
    })
    .await?;

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let conn = a.dial("t-c", "echo").await?;
    let (mut reader, mut writer) = tokio::io::split(conn);
    let sent = payload.clone();
    let writing = async move {
        writer.write_all(&sent).await?;
        writer.shutdown().await?;
        anyhow::Ok(())
    };
    let reading = async move {
        let mut echoed = Vec::new();
        reader.read_to_end(&mut echoed).await?;
        anyhow::Ok(echoed)
    };
    let (written, echoed) = tokio::time::timeout(SETTLE * 4, async {
        tokio::join!(writing, reading)
    })
    .await?;
    written?;
    assert_eq!(echoed?, payload);
    let _listener = server.await??;

    shutdown_all(&nodes);
    Ok(())
}

/// Dialing a service nobody listens on fails instead of hanging.
#[tokio::test]
async fn test_dial_unknown_service_fails() -> Result<()> {
    let nodes = chain(&["d-a", "d-b"]).await?;
    let result = tokio::time::timeout(SETTLE, nodes[0].dial("d-b", "absent")).await?;
    assert!(result.is_err());

    let result = nodes[0].dial("d-zz", "absent").await;
    assert!(matches!(result, Err(NetError::NoRoute(_))));

    shutdown_all(&nodes);
    Ok(())
}
