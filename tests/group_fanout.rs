//! Integration tests for group subscriptions and broadcast fan-out.

mod common;

use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use pan_node::bus::BusTopic;

use common::{broadcast_frame, control_frame, start_node, TestClient};

#[tokio::test]
async fn broadcast_fans_out_to_members_except_sender() {
    let overlay = start_node().await;
    let group = "11111111-1111-1111-1111-111111111111";

    let mut x = TestClient::connect(overlay.node.agent_addr()).await;
    let sx = x.authenticate(&overlay.agent_token("x")).await;
    let mut y = TestClient::connect(overlay.node.agent_addr()).await;
    let sy = y.authenticate(&overlay.agent_token("y")).await;
    let mut z = TestClient::connect(overlay.node.agent_addr()).await;
    let sz = z.authenticate(&overlay.agent_token("z")).await;

    x.join_group(&sx, group, &["chat"]).await;
    y.join_group(&sy, group, &["chat"]).await;
    z.join_group(&sz, group, &["chat"]).await;

    let mut bus_rx = overlay.node.bus().subscribe(BusTopic::AgentBroadcast);

    x.send(&broadcast_frame(&sx, group, "chat", json!({ "t": "hi" })))
        .await;

    // Y and Z each receive exactly one copy.
    for client in [&mut y, &mut z] {
        let frame = client.recv().await;
        assert_eq!(frame["type"], "broadcast");
        assert_eq!(frame["msg_type"], "chat");
        assert_eq!(frame["payload"]["t"], "hi");
        assert_eq!(frame["from"]["conn_id"], sx.conn_id.as_str());
        assert!(
            client.recv_or_eof_quick().await.is_none(),
            "received a duplicate broadcast"
        );
    }

    // X receives none (checked above via quick timeout on y/z; check x too).
    assert!(x.recv_or_eof_quick().await.is_none());

    // The bus observed exactly one outbound emission.
    let event = tokio::time::timeout(Duration::from_secs(2), bus_rx.recv())
        .await
        .expect("bus emission")
        .unwrap();
    match event {
        pan_node::bus::BusEvent::AgentBroadcast { from, message } => {
            assert_eq!(from.conn_id, sx.conn_id);
            assert_eq!(message.msg_type, "chat");
        }
        other => panic!("unexpected bus event: {other:?}"),
    }
    assert!(bus_rx.try_recv().is_err());
}

#[tokio::test]
async fn broadcast_respects_msg_type_subscriptions() {
    let overlay = start_node().await;
    let group = Uuid::new_v4().to_string();

    let mut sender = TestClient::connect(overlay.node.agent_addr()).await;
    let ss = sender.authenticate(&overlay.agent_token("sender")).await;
    let mut listener = TestClient::connect(overlay.node.agent_addr()).await;
    let sl = listener.authenticate(&overlay.agent_token("listener")).await;

    listener.join_group(&sl, &group, &["presence"]).await;

    sender
        .send(&broadcast_frame(&ss, &group, "chat", json!({ "t": "x" })))
        .await;
    assert!(listener.recv_or_eof_quick().await.is_none());

    sender
        .send(&broadcast_frame(&ss, &group, "presence", json!({ "t": "y" })))
        .await;
    let frame = listener.recv().await;
    assert_eq!(frame["msg_type"], "presence");
}

#[tokio::test]
async fn leave_group_stops_delivery() {
    let overlay = start_node().await;
    let group = Uuid::new_v4().to_string();

    let mut sender = TestClient::connect(overlay.node.agent_addr()).await;
    let ss = sender.authenticate(&overlay.agent_token("sender")).await;
    let mut listener = TestClient::connect(overlay.node.agent_addr()).await;
    let sl = listener.authenticate(&overlay.agent_token("listener")).await;

    listener.join_group(&sl, &group, &["chat"]).await;

    listener
        .send(&control_frame(&sl, "leave_group", json!({ "group": group })))
        .await;
    let reply = listener.recv().await;
    assert_eq!(reply["msg_type"], "leave_group_reply");
    assert_eq!(reply["payload"]["status"], "ok");

    sender
        .send(&broadcast_frame(&ss, &group, "chat", json!({ "t": "gone" })))
        .await;
    assert!(listener.recv_or_eof_quick().await.is_none());
    assert_eq!(overlay.node.stats().subscriptions, 0);
}

#[tokio::test]
async fn join_group_cap_is_reported() {
    let overlay = start_node().await;
    let group = Uuid::new_v4().to_string();

    let mut client = TestClient::connect(overlay.node.agent_addr()).await;
    let session = client.authenticate(&overlay.agent_token("greedy")).await;

    let too_many: Vec<String> = (0..101).map(|i| format!("t{}", i)).collect();
    client
        .send(&control_frame(
            &session,
            "join_group",
            json!({ "group": group, "msg_types": too_many }),
        ))
        .await;

    let reply = client.recv().await;
    assert_eq!(reply["msg_type"], "join_group_reply");
    assert_eq!(reply["payload"]["status"], "failed");
    assert_eq!(overlay.node.stats().subscriptions, 0);

    // Exactly at the cap is fine.
    let at_cap: Vec<String> = (0..100).map(|i| format!("t{}", i)).collect();
    client
        .send(&control_frame(
            &session,
            "join_group",
            json!({ "group": group, "msg_types": at_cap }),
        ))
        .await;
    let reply = client.recv().await;
    assert_eq!(reply["payload"]["status"], "ok");
    assert_eq!(overlay.node.stats().subscriptions, 100);
}

#[tokio::test]
async fn join_is_idempotent_across_repeats() {
    let overlay = start_node().await;
    let group = Uuid::new_v4().to_string();

    let mut client = TestClient::connect(overlay.node.agent_addr()).await;
    let session = client.authenticate(&overlay.agent_token("repeat")).await;

    client.join_group(&session, &group, &["chat"]).await;
    client.join_group(&session, &group, &["chat"]).await;
    assert_eq!(overlay.node.stats().subscriptions, 1);
}

#[tokio::test]
async fn ping_request_reaches_the_bus() {
    let overlay = start_node().await;
    let mut bus_rx = overlay.node.bus().subscribe(BusTopic::AgentPing);

    let mut client = TestClient::connect(overlay.node.agent_addr()).await;
    let session = client.authenticate(&overlay.agent_token("pinger")).await;

    let dest = Uuid::new_v4();
    client
        .send(&control_frame(
            &session,
            "ping_request",
            json!({ "dest_node_id": dest.to_string(), "msg": "hello", "ttl": 8 }),
        ))
        .await;

    let event = tokio::time::timeout(Duration::from_secs(2), bus_rx.recv())
        .await
        .expect("ping emission")
        .unwrap();
    match event {
        pan_node::bus::BusEvent::AgentPing {
            dest_node_id,
            msg,
            ttl,
            ..
        } => {
            assert_eq!(dest_node_id, dest);
            assert_eq!(msg, "hello");
            assert_eq!(ttl, 8);
        }
        other => panic!("unexpected bus event: {other:?}"),
    }
}

// Quick-receive extension used only in this file.
impl TestClient {
    async fn recv_or_eof_quick(&mut self) -> Option<serde_json::Value> {
        tokio::time::timeout(Duration::from_millis(300), async { self.recv_or_eof().await })
            .await
            .ok()
            .flatten()
    }
}
