//! Socket-level tests: real clients against a running server.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use bytes::Bytes;
use transport_client::{StableClient, UnstableClient};
use transport_shared::{
    config::TransportConfig,
    event::TransportEvent,
    packet::{encode_datagram, encode_stable_frame, UnstablePacketHeader},
};
use transport_tests::{
    init_tracing, next_event, start_loopback, wait_for, wait_until, EVENT_TIMEOUT,
};

fn any_local() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stable_frames_are_delivered_whole() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut events) = start_loopback(TransportConfig::loopback(), 2).await?;
    let mut client = StableClient::connect(server.stable_addr().context("stable addr")?).await?;
    let local = client.local_addr()?;

    assert_eq!(
        next_event(&mut events).await?,
        TransportEvent::StableConnected { addr: local }
    );

    client.send(b"hello").await?;

    // One frame dribbled out in three writes.
    let frame = encode_stable_frame(b"fragmented payload")?;
    for chunk in [&frame[..2], &frame[2..9], &frame[9..]] {
        client.send_raw(chunk).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    client.send(b"").await?;

    for expected in [&b"hello"[..], b"fragmented payload", b""] {
        assert_eq!(
            next_event(&mut events).await?,
            TransportEvent::StableMessage {
                addr: local,
                payload: Bytes::copy_from_slice(expected),
            }
        );
    }

    client.shutdown().await?;
    assert_eq!(
        next_event(&mut events).await?,
        TransportEvent::StableDisconnected { addr: local }
    );
    wait_until(|| server.connection_count() == 0).await?;

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn datagram_loss_is_counted_per_peer() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut events) = start_loopback(TransportConfig::loopback(), 1).await?;
    let target = server.unstable_addr().context("unstable addr")?;
    let mut client = UnstableClient::connect(any_local(), target).await?;
    let local = client.local_addr()?;

    for index in 0..=40u16 {
        if index == 5 {
            client.skip();
            continue;
        }
        client.send(format!("tick {index}").as_bytes()).await?;
        // Loopback rarely reorders, but pacing keeps the count exact.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut seen = Vec::new();
    let mut last_lost = 0;
    while seen.len() < 40 {
        match next_event(&mut events).await? {
            TransportEvent::UnstableMessage {
                addr,
                header,
                payload,
                lost_receive_packets,
                lost_sent_packets,
            } => {
                assert_eq!(addr, local);
                assert_eq!(payload, Bytes::from(format!("tick {}", header.packet_index)));
                // The client never received anything, so it reports no acks.
                assert_eq!(lost_sent_packets, 0);
                if header.packet_index < 36 {
                    assert_eq!(lost_receive_packets, 0);
                }
                seen.push(header.packet_index);
                last_lost = lost_receive_packets;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert!(!seen.contains(&5));
    assert_eq!(last_lost, 1);

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_datagrams_are_dropped() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut events) = start_loopback(TransportConfig::loopback(), 1).await?;
    let target = server.unstable_addr().context("unstable addr")?;
    let mut client = UnstableClient::connect(any_local(), target).await?;

    let mut bad_magic = UnstablePacketHeader::new(7, 0);
    bad_magic.magic = 0x1234;
    client.send_raw(&encode_datagram(bad_magic, b"nope")?).await?;

    // Too short for a header.
    client.send_raw(&[0xDD, 0xFF, 0x00]).await?;

    // Declares more payload than it carries.
    let honest = encode_datagram(UnstablePacketHeader::new(8, 0), b"abcdef")?;
    client.send_raw(&honest[..honest.len() - 2]).await?;

    // Bigger than the datagram limit.
    let huge = vec![0u8; 2000];
    client
        .send_raw(&encode_datagram(UnstablePacketHeader::new(9, 0), &huge)?)
        .await?;

    let sent = client.send(b"valid").await?;
    match next_event(&mut events).await? {
        TransportEvent::UnstableMessage {
            header, payload, ..
        } => {
            assert_eq!(header, sent);
            assert_eq!(payload.as_ref(), b"valid");
        }
        other => panic!("unexpected event {other:?}"),
    }

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_frame_closes_only_its_connection() -> anyhow::Result<()> {
    init_tracing();
    let cfg = TransportConfig {
        max_stable_packet_size: 64,
        ..TransportConfig::loopback()
    };
    let (mut server, mut events) = start_loopback(cfg, 2).await?;
    let stable = server.stable_addr().context("stable addr")?;

    let mut offender = StableClient::connect(stable).await?;
    let mut bystander = StableClient::connect(stable).await?;
    let offender_addr = offender.local_addr()?;
    let bystander_addr = bystander.local_addr()?;
    wait_until(|| server.connection_count() == 2).await?;

    offender.send(&[0u8; 65]).await?;
    wait_for(&mut events, |event| {
        *event == TransportEvent::StableDisconnected { addr: offender_addr }
    })
    .await?;

    bystander.send(&[1u8; 64]).await?;
    let delivered = wait_for(&mut events, |event| {
        matches!(event, TransportEvent::StableMessage { .. })
    })
    .await?;
    assert_eq!(
        delivered,
        TransportEvent::StableMessage {
            addr: bystander_addr,
            payload: Bytes::from(vec![1u8; 64]),
        }
    );
    assert_eq!(server.connection_count(), 1);

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connections_spread_across_processors() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut events) = start_loopback(TransportConfig::loopback(), 2).await?;
    let stable = server.stable_addr().context("stable addr")?;

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(StableClient::connect(stable).await?);
        wait_for(&mut events, |event| {
            matches!(event, TransportEvent::StableConnected { .. })
        })
        .await?;
    }
    wait_until(|| server.connection_count() == 4).await?;
    assert_eq!(server.table_sizes(), vec![2, 2]);

    // Every connection is served by whichever processor owns it.
    for (n, client) in clients.iter_mut().enumerate() {
        client.send(format!("from {n}").as_bytes()).await?;
    }
    let mut received = Vec::new();
    while received.len() < 4 {
        if let TransportEvent::StableMessage { payload, .. } = next_event(&mut events).await? {
            received.push(String::from_utf8(payload.to_vec())?);
        }
    }
    received.sort();
    assert_eq!(received, ["from 0", "from 1", "from 2", "from 3"]);

    server.stop().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_reports_open_connections_closed() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut events) = start_loopback(TransportConfig::loopback(), 1).await?;
    let client = StableClient::connect(server.stable_addr().context("stable addr")?).await?;
    let local = client.local_addr()?;
    wait_until(|| server.connection_count() == 1).await?;

    server.stop().await?;
    assert_eq!(server.connection_count(), 0);
    wait_for(&mut events, |event| {
        *event == TransportEvent::StableDisconnected { addr: local }
    })
    .await?;
    Ok(())
}

/// Waits until the server has reported the peer's datagram `last`.
async fn drain_unstable_until(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<TransportEvent>,
    last: u16,
) -> anyhow::Result<UnstablePacketHeader> {
    loop {
        if let TransportEvent::UnstableMessage { header, .. } = next_event(events).await? {
            if header.packet_index == last {
                return Ok(header);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_replies_acknowledge_client_datagrams() -> anyhow::Result<()> {
    init_tracing();
    let (mut server, mut events) = start_loopback(TransportConfig::loopback(), 1).await?;
    let target = server.unstable_addr().context("unstable addr")?;
    let mut client = UnstableClient::connect(any_local(), target).await?;
    let local = client.local_addr()?;

    for index in 0..=20u16 {
        if index == 5 {
            client.skip();
        } else {
            client.send(b"tick").await?;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    drain_unstable_until(&mut events, 20).await?;

    server.send_unstable(local, b"pong")?;
    let (reply, payload) = client
        .recv_timeout(EVENT_TIMEOUT)
        .await?
        .context("first reply")?;
    assert_eq!(payload.as_ref(), b"pong");
    assert_eq!(reply.packet_index, 0);
    assert_eq!(reply.last_received_packet_index, 20);
    assert_eq!(reply.remote_receive_bitfield & (1 << 15), 0);
    assert_eq!(reply.remote_receive_bitfield.count_ones(), 20);
    // The gap is still inside the window.
    assert_eq!(client.lost_sent_packets(), 0);

    for _ in 21..=40u16 {
        client.send(b"tick").await?;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    // Client headers now acknowledge the server's reply.
    let echoed = drain_unstable_until(&mut events, 40).await?;
    assert_eq!(echoed.last_received_packet_index, 0);
    assert_eq!(echoed.remote_receive_bitfield, 1);

    server.send_unstable(local, b"pong")?;
    let (reply, _) = client
        .recv_timeout(EVENT_TIMEOUT)
        .await?
        .context("second reply")?;
    assert_eq!(reply.packet_index, 1);
    assert_eq!(reply.last_received_packet_index, 40);
    assert_eq!(client.lost_sent_packets(), 1);
    assert_eq!(client.lost_receive_packets(), 0);

    server.stop().await?;
    Ok(())
}
