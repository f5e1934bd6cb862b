//! Leader-aware connection picking.
//!
//! Writes go to the leader. Reads rotate over the followers and fall back
//! to the leader when there are none.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{Span, warn};

use crate::error::{RouterError, RouterResult};

/// Marker in method names that classifies a request as a write.
pub const WRITE_METHOD: &str = "Produce";

/// Whether `method` names a write, which only the leader can serve.
pub fn is_write(method: &str) -> bool {
    method.contains(WRITE_METHOD)
}

/// A resolved address with its connection handle.
#[derive(Debug, Clone)]
pub struct SubConn<C> {
    pub addr: String,
    /// `None` when the resolver gave no leader attribute for the address.
    pub is_leader: Option<bool>,
    pub conn: C,
}

#[derive(Debug)]
pub struct Picker<C> {
    leader: Option<C>,
    followers: Vec<C>,
    current: AtomicU64,
}

impl<C: Clone> Picker<C> {
    pub fn build(subconns: impl IntoIterator<Item = SubConn<C>>, span: &Span) -> Self {
        let mut leader = None;
        let mut followers = Vec::new();

        for sc in subconns {
            match sc.is_leader {
                Some(true) => leader = Some(sc.conn),
                Some(false) => followers.push(sc.conn),
                None => {
                    warn!(parent: span, "No leader attribute for {}, treating it as a follower", sc.addr);
                    followers.push(sc.conn);
                }
            }
        }

        Self {
            leader,
            followers,
            current: AtomicU64::new(0),
        }
    }

    pub fn pick(&self, method: &str) -> RouterResult<C> {
        let picked = if is_write(method) || self.followers.is_empty() {
            self.leader.clone()
        } else {
            Some(self.next_follower())
        };
        picked.ok_or(RouterError::NoConnectionAvailable)
    }

    fn next_follower(&self) -> C {
        let cur = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        let idx = (cur % self.followers.len() as u64) as usize;
        self.followers[idx].clone()
    }

    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    pub fn followers(&self) -> usize {
        self.followers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subconn(id: usize, is_leader: Option<bool>) -> SubConn<usize> {
        SubConn {
            addr: format!("127.0.0.1:{}", 9000 + id),
            is_leader,
            conn: id,
        }
    }

    #[test]
    fn test_picker_no_subconn_available() {
        let picker: Picker<usize> = Picker::build(Vec::new(), &Span::none());
        for method in ["/log.v1.Log/Produce", "/log.v1.Log/Consume"] {
            assert!(matches!(
                picker.pick(method),
                Err(RouterError::NoConnectionAvailable)
            ));
        }
    }

    #[test]
    fn test_picker_produce_and_consume_to_leader_without_followers() {
        let picker = Picker::build(vec![subconn(0, Some(true))], &Span::none());
        assert_eq!(picker.pick("Produce").unwrap(), 0);
        assert_eq!(picker.pick("Consume").unwrap(), 0);
    }

    #[test]
    fn test_picker_produces_to_leader() {
        let picker = Picker::build(
            vec![subconn(0, Some(true)), subconn(1, Some(false)), subconn(2, Some(false))],
            &Span::none(),
        );
        for _ in 0..5 {
            assert_eq!(picker.pick("Produce").unwrap(), 0);
            assert_eq!(picker.pick("ProduceStream").unwrap(), 0);
        }
    }

    #[test]
    fn test_picker_consumes_from_followers() {
        let picker = Picker::build(
            vec![subconn(0, Some(true)), subconn(1, Some(false)), subconn(2, Some(false))],
            &Span::none(),
        );
        // followers[1], followers[0], followers[1]
        assert_eq!(picker.pick("Consume").unwrap(), 2);
        assert_eq!(picker.pick("Consume").unwrap(), 1);
        assert_eq!(picker.pick("Consume").unwrap(), 2);
        assert_eq!(picker.pick("Produce").unwrap(), 0);
    }

    #[test]
    fn test_picker_missing_leader_attribute() {
        let picker = Picker::build(vec![subconn(0, None), subconn(1, None)], &Span::none());
        assert!(!picker.has_leader());
        assert_eq!(picker.followers(), 2);
        assert!(picker.pick("Consume").is_ok());
        assert!(matches!(
            picker.pick("Produce"),
            Err(RouterError::NoConnectionAvailable)
        ));
    }
}
