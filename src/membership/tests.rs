use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::Span;

use super::handler::dispatch;
use super::*;
use crate::error::MembershipError;

struct RecordingHandler {
    joins: mpsc::UnboundedSender<(String, String)>,
    leaves: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MembershipHandler for RecordingHandler {
    async fn join(&self, name: &str, rpc_addr: &str) -> MembershipResult<()> {
        let _ = self.joins.send((name.to_string(), rpc_addr.to_string()));
        Ok(())
    }

    async fn leave(&self, name: &str) -> MembershipResult<()> {
        let _ = self.leaves.send(name.to_string());
        Ok(())
    }
}

struct Recorded {
    joins: mpsc::UnboundedReceiver<(String, String)>,
    leaves: mpsc::UnboundedReceiver<String>,
}

fn handler() -> (Arc<RecordingHandler>, Recorded) {
    let (joins_tx, joins) = mpsc::unbounded_channel();
    let (leaves_tx, leaves) = mpsc::unbounded_channel();
    (
        Arc::new(RecordingHandler {
            joins: joins_tx,
            leaves: leaves_tx,
        }),
        Recorded { joins, leaves },
    )
}

fn config(id: usize, seeds: Vec<String>) -> MembershipConfig {
    MembershipConfig {
        node_name: id.to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        start_join_addrs: seeds,
        gossip_interval: Duration::from_millis(50),
        suspect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
    .with_rpc_addr(format!("127.0.0.1:{}", 9000 + id))
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for membership event")
        .expect("handler dropped")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn test_join_and_leave() {
    let (h0, mut rec0) = handler();
    let m0 = Membership::start(config(0, vec![]), h0, Span::none())
        .await
        .unwrap();
    let seed = m0.local_addr().unwrap().to_string();

    let (h1, _rec1) = handler();
    let m1 = Membership::start(config(1, vec![seed.clone()]), h1, Span::none())
        .await
        .unwrap();
    let (h2, _rec2) = handler();
    let m2 = Membership::start(config(2, vec![seed]), h2, Span::none())
        .await
        .unwrap();

    let mut joined = vec![recv(&mut rec0.joins).await, recv(&mut rec0.joins).await];
    joined.sort();
    assert_eq!(
        joined,
        vec![
            ("1".to_string(), "127.0.0.1:9001".to_string()),
            ("2".to_string(), "127.0.0.1:9002".to_string()),
        ]
    );
    eventually(|| m0.members().len() == 3).await;
    eventually(|| m1.members().len() == 3).await;

    m2.leave().await.unwrap();
    assert_eq!(recv(&mut rec0.leaves).await, "2");

    let members = m0.members();
    assert_eq!(members.len(), 3);
    let left = members.iter().find(|m| m.name == "2").unwrap();
    assert_eq!(left.status, MemberStatus::Left);
    assert!(rec0.leaves.try_recv().is_err());
}

#[tokio::test]
async fn test_silent_member_reported_failed() {
    let (h0, mut rec0) = handler();
    let mut cfg = config(0, vec![]);
    cfg.suspect_timeout = Duration::from_millis(300);
    let m0 = Membership::start(cfg, h0, Span::none()).await.unwrap();
    let seed = m0.local_addr().unwrap().to_string();

    let (h1, _rec1) = handler();
    let m1 = Membership::start(config(1, vec![seed]), h1, Span::none())
        .await
        .unwrap();
    assert_eq!(recv(&mut rec0.joins).await.0, "1");

    drop(m1);
    assert_eq!(recv(&mut rec0.leaves).await, "1");
    let failed = m0.members().into_iter().find(|m| m.name == "1").unwrap();
    assert_eq!(failed.status, MemberStatus::Failed);
}

#[tokio::test]
async fn test_unreachable_seeds() {
    let (h, _rec) = handler();
    let result = Membership::start(
        config(0, vec!["not an address".to_string()]),
        h,
        Span::none(),
    )
    .await;
    assert!(matches!(result, Err(MembershipError::NoSeedReachable)));
}

struct FlakyHandler {
    joins: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl MembershipHandler for FlakyHandler {
    async fn join(&self, name: &str, _rpc_addr: &str) -> MembershipResult<()> {
        match name {
            "1" => Err(MembershipError::NotLeader),
            "2" => Err(MembershipError::Reconcile("boom".to_string())),
            _ => {
                let _ = self.joins.send(name.to_string());
                Ok(())
            }
        }
    }

    async fn leave(&self, _name: &str) -> MembershipResult<()> {
        Ok(())
    }
}

fn member(name: &str, rpc_addr: Option<&str>) -> Member {
    let mut tags = BTreeMap::new();
    if let Some(addr) = rpc_addr {
        tags.insert(RPC_ADDR_TAG.to_string(), addr.to_string());
    }
    Member {
        name: name.to_string(),
        addr: "127.0.0.1:1".parse().unwrap(),
        tags,
        heartbeat: 1,
        status: MemberStatus::Alive,
    }
}

#[tokio::test]
async fn test_dispatch_survives_handler_errors() {
    let (joins_tx, mut joins) = mpsc::unbounded_channel();
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(MembershipEvent::Join(member("1", Some("a:1")))).unwrap();
    tx.send(MembershipEvent::Join(member("2", Some("b:1")))).unwrap();
    tx.send(MembershipEvent::Join(member("3", None))).unwrap();
    tx.send(MembershipEvent::Join(member("4", Some("d:1")))).unwrap();
    drop(tx);

    dispatch(rx, Arc::new(FlakyHandler { joins: joins_tx }), Span::none()).await;

    assert_eq!(joins.recv().await.unwrap(), "4");
    assert!(joins.recv().await.is_none());
}
