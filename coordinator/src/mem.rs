//! In-memory implementation of [`Client`].
//!
//! Backs every test of the write path and mirrors the semantics the real
//! service guarantees: linearizable updates, per-parent sequential naming,
//! all-or-nothing multi-op transactions, one-shot watches and
//! session-scoped ephemeral nodes.

use crate::{
    Client, CreateMode, Error, ErrorKind, Event, MultiError, Op, OpResponse, Result, Stat,
};
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicBool, Ordering},
};

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
    ephemeral: bool,
    /// Counter for sequential children of this node.
    seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral: bool) -> Self {
        Self {
            data,
            version: 0,
            ephemeral,
            seq: 0,
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            ephemeral: self.ephemeral,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Event>>,
}

impl State {
    fn fire_watches(&mut self, path: &str) {
        if let Some(events) = self.watches.remove(path) {
            for event in events {
                event.notify();
            }
        }
    }
}

/// An in-process coordinator.
#[derive(Debug)]
pub struct MemCoordinator {
    state: Mutex<State>,
    expired: AtomicBool,
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordinator {
    /// A coordinator holding only the root node.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_owned(), Node::new(vec![], false));
        Self {
            state: Mutex::new(State {
                nodes,
                watches: HashMap::new(),
            }),
            expired: AtomicBool::new(false),
        }
    }

    /// Expire the session: ephemeral nodes disappear, all watches fire, and
    /// every subsequent call fails with `SessionExpired`.
    pub fn expire(&self) {
        self.expired.store(true, Ordering::SeqCst);

        let mut state = self.state.lock();
        let ephemeral: Vec<_> = state
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &ephemeral {
            state.nodes.remove(path);
        }
        debug!(count = ephemeral.len(), "expired session, dropped ephemeral nodes");

        let watched: Vec<_> = state.watches.keys().cloned().collect();
        for path in watched {
            state.fire_watches(&path);
        }
    }

    fn check_alive(&self, path: &str) -> Result<()> {
        if self.expired.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::SessionExpired, path));
        }
        Ok(())
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "/",
    }
}

/// Apply one op to `nodes`, recording into `touched` the path whose watches
/// must fire if the whole transaction commits.
fn apply(nodes: &mut BTreeMap<String, Node>, op: &Op, touched: &mut Vec<String>) -> Result<OpResponse> {
    match op {
        Op::Create { path, data, mode } => {
            let (actual, ephemeral) = match mode {
                CreateMode::PersistentSequential => {
                    let parent_path = parent_of(path);
                    let parent = nodes
                        .get_mut(parent_path)
                        .ok_or_else(|| Error::new(ErrorKind::NoNode, path.as_str()))?;
                    let seq = parent.seq;
                    parent.seq += 1;
                    (format!("{path}{seq:010}"), false)
                }
                CreateMode::Persistent | CreateMode::Ephemeral => {
                    if !nodes.contains_key(parent_of(path)) {
                        return Err(Error::new(ErrorKind::NoNode, path.as_str()));
                    }
                    (path.clone(), matches!(mode, CreateMode::Ephemeral))
                }
            };

            if nodes.contains_key(&actual) {
                return Err(Error::new(ErrorKind::NodeExists, actual));
            }
            nodes.insert(actual.clone(), Node::new(data.clone(), ephemeral));
            Ok(OpResponse::Created { path: actual })
        }

        Op::Delete { path, version } => {
            let node = nodes
                .get(path)
                .ok_or_else(|| Error::new(ErrorKind::NoNode, path.as_str()))?;
            if let Some(expected) = version {
                if node.version != *expected {
                    return Err(Error::new(ErrorKind::BadVersion, path.as_str()));
                }
            }
            let child_prefix = format!("{path}/");
            if nodes.range(child_prefix.clone()..).next().is_some_and(|(p, _)| p.starts_with(&child_prefix)) {
                return Err(Error::new(ErrorKind::NotEmpty, path.as_str()));
            }
            nodes.remove(path);
            touched.push(path.clone());
            Ok(OpResponse::Deleted)
        }

        Op::CheckVersion { path, version } => {
            let node = nodes
                .get(path)
                .ok_or_else(|| Error::new(ErrorKind::NoNode, path.as_str()))?;
            if node.version != *version {
                return Err(Error::new(ErrorKind::BadVersion, path.as_str()));
            }
            Ok(OpResponse::Checked)
        }

        Op::SetData {
            path,
            data,
            version,
        } => {
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| Error::new(ErrorKind::NoNode, path.as_str()))?;
            if let Some(expected) = version {
                if node.version != *expected {
                    return Err(Error::new(ErrorKind::BadVersion, path.as_str()));
                }
            }
            node.data = data.clone();
            node.version += 1;
            let stat = node.stat();
            touched.push(path.clone());
            Ok(OpResponse::DataSet { stat })
        }
    }
}

impl Client for MemCoordinator {
    fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode) -> Result<String> {
        self.check_alive(path)?;
        let mut state = self.state.lock();
        let mut touched = Vec::new();
        let response = apply(
            &mut state.nodes,
            &Op::Create {
                path: path.to_owned(),
                data,
                mode,
            },
            &mut touched,
        )?;
        match response {
            OpResponse::Created { path } => Ok(path),
            _ => unreachable!("create op yields a create response"),
        }
    }

    fn exists(&self, path: &str) -> Result<Option<Stat>> {
        self.check_alive(path)?;
        Ok(self.state.lock().nodes.get(path).map(Node::stat))
    }

    fn exists_many(&self, paths: &[String]) -> Result<Vec<Option<Stat>>> {
        self.check_alive(paths.first().map(String::as_str).unwrap_or("/"))?;
        let state = self.state.lock();
        Ok(paths
            .iter()
            .map(|path| state.nodes.get(path).map(Node::stat))
            .collect())
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.try_get(path)?
            .ok_or_else(|| Error::new(ErrorKind::NoNode, path))
    }

    fn try_get(&self, path: &str) -> Result<Option<(Vec<u8>, Stat)>> {
        self.check_alive(path)?;
        Ok(self
            .state
            .lock()
            .nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat())))
    }

    fn try_get_watch(&self, path: &str, watch: &Event) -> Result<Option<(Vec<u8>, Stat)>> {
        self.check_alive(path)?;
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get(path) else {
            return Ok(None);
        };
        let result = (node.data.clone(), node.stat());
        state
            .watches
            .entry(path.to_owned())
            .or_default()
            .push(watch.clone());
        Ok(Some(result))
    }

    fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_alive(path)?;
        let state = self.state.lock();
        if !state.nodes.contains_key(path) {
            return Err(Error::new(ErrorKind::NoNode, path));
        }

        let prefix = if path == "/" {
            "/".to_owned()
        } else {
            format!("{path}/")
        };
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let name = &p[prefix.len()..];
                (!name.is_empty() && !name.contains('/')).then(|| name.to_owned())
            })
            .collect())
    }

    fn set_data(&self, path: &str, data: Vec<u8>, version: Option<i32>) -> Result<Stat> {
        self.check_alive(path)?;
        let mut state = self.state.lock();
        let mut touched = Vec::new();
        let response = apply(
            &mut state.nodes,
            &Op::SetData {
                path: path.to_owned(),
                data,
                version,
            },
            &mut touched,
        )?;
        for path in touched {
            state.fire_watches(&path);
        }
        match response {
            OpResponse::DataSet { stat } => Ok(stat),
            _ => unreachable!("set-data op yields a data-set response"),
        }
    }

    fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        self.check_alive(path)?;
        let mut state = self.state.lock();
        let mut touched = Vec::new();
        apply(
            &mut state.nodes,
            &Op::Delete {
                path: path.to_owned(),
                version,
            },
            &mut touched,
        )?;
        for path in touched {
            state.fire_watches(&path);
        }
        Ok(())
    }

    fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResponse>, MultiError> {
        if let Err(source) = self.check_alive("/") {
            return Err(MultiError {
                source,
                failed_op_index: None,
            });
        }

        let mut state = self.state.lock();

        // stage against a copy so a mid-transaction failure leaves no trace
        let mut staged = state.nodes.clone();
        let mut touched = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            match apply(&mut staged, op, &mut touched) {
                Ok(response) => responses.push(response),
                Err(source) => {
                    return Err(MultiError {
                        source,
                        failed_op_index: Some(index),
                    })
                }
            }
        }

        state.nodes = staged;
        for path in touched {
            state.fire_watches(&path);
        }
        Ok(responses)
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_ancestors;

    fn coordinator() -> MemCoordinator {
        MemCoordinator::new()
    }

    #[test]
    fn test_create_get_children() {
        let c = coordinator();
        c.create("/t", b"root".to_vec(), CreateMode::Persistent)
            .unwrap();
        c.create("/t/a", vec![], CreateMode::Persistent).unwrap();
        c.create("/t/b", b"bee".to_vec(), CreateMode::Persistent)
            .unwrap();
        c.create("/t/a/nested", vec![], CreateMode::Persistent)
            .unwrap();

        assert_eq!(c.get_children("/t").unwrap(), vec!["a", "b"]);
        assert_eq!(c.get("/t/b").unwrap().0, b"bee");
        assert_eq!(c.get("/t/b").unwrap().1.version, 0);

        let err = c
            .create("/t/b", vec![], CreateMode::Persistent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeExists);

        let err = c
            .create("/missing/child", vec![], CreateMode::Persistent)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoNode);
    }

    #[test]
    fn test_sequential_names_are_per_parent() {
        let c = coordinator();
        c.create("/log", vec![], CreateMode::Persistent).unwrap();
        c.create("/other", vec![], CreateMode::Persistent).unwrap();

        assert_eq!(
            c.create("/log/log-", vec![], CreateMode::PersistentSequential)
                .unwrap(),
            "/log/log-0000000000"
        );
        assert_eq!(
            c.create("/log/log-", vec![], CreateMode::PersistentSequential)
                .unwrap(),
            "/log/log-0000000001"
        );
        assert_eq!(
            c.create("/other/block-", vec![], CreateMode::PersistentSequential)
                .unwrap(),
            "/other/block-0000000000"
        );
    }

    #[test]
    fn test_set_data_versions() {
        let c = coordinator();
        c.create("/n", vec![], CreateMode::Persistent).unwrap();

        let stat = c.set_data("/n", b"v1".to_vec(), None).unwrap();
        assert_eq!(stat.version, 1);

        let err = c.set_data("/n", b"v2".to_vec(), Some(0)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadVersion);
        c.set_data("/n", b"v2".to_vec(), Some(1)).unwrap();
    }

    #[test]
    fn test_delete_guards() {
        let c = coordinator();
        c.create("/n", vec![], CreateMode::Persistent).unwrap();
        c.create("/n/child", vec![], CreateMode::Persistent).unwrap();

        assert_eq!(c.delete("/n", None).unwrap_err().kind, ErrorKind::NotEmpty);
        c.delete("/n/child", None).unwrap();
        assert_eq!(
            c.delete("/n", Some(7)).unwrap_err().kind,
            ErrorKind::BadVersion
        );
        c.delete("/n", Some(0)).unwrap();
        assert_eq!(c.delete("/n", None).unwrap_err().kind, ErrorKind::NoNode);
    }

    #[test]
    fn test_multi_is_atomic() {
        let c = coordinator();
        c.create("/t", vec![], CreateMode::Persistent).unwrap();

        let err = c
            .multi(vec![
                Op::Create {
                    path: "/t/a".into(),
                    data: vec![],
                    mode: CreateMode::Persistent,
                },
                Op::CheckVersion {
                    path: "/t".into(),
                    version: 99,
                },
            ])
            .unwrap_err();
        assert_eq!(err.failed_op_index, Some(1));
        assert_eq!(err.source.kind, ErrorKind::BadVersion);
        // first op must not have applied
        assert!(c.exists("/t/a").unwrap().is_none());

        let responses = c
            .multi(vec![
                Op::Create {
                    path: "/t/seq-".into(),
                    data: vec![],
                    mode: CreateMode::PersistentSequential,
                },
                Op::SetData {
                    path: "/t".into(),
                    data: b"x".to_vec(),
                    version: Some(0),
                },
            ])
            .unwrap();
        assert_eq!(
            responses[0],
            OpResponse::Created {
                path: "/t/seq-0000000000".into()
            }
        );
    }

    #[test]
    fn test_staged_sequence_numbers_do_not_leak() {
        let c = coordinator();
        c.create("/t", vec![], CreateMode::Persistent).unwrap();

        // a failing multi must not consume a sequence number
        c.multi(vec![
            Op::Create {
                path: "/t/seq-".into(),
                data: vec![],
                mode: CreateMode::PersistentSequential,
            },
            Op::CheckVersion {
                path: "/t".into(),
                version: 99,
            },
        ])
        .unwrap_err();

        assert_eq!(
            c.create("/t/seq-", vec![], CreateMode::PersistentSequential)
                .unwrap(),
            "/t/seq-0000000000"
        );
    }

    #[test]
    fn test_watch_fires_on_delete_and_change() {
        let c = coordinator();
        c.create("/n", vec![], CreateMode::Persistent).unwrap();

        let watch = Event::new();
        assert!(c.try_get_watch("/n", &watch).unwrap().is_some());
        assert!(!watch.is_set());
        c.set_data("/n", b"x".to_vec(), None).unwrap();
        assert!(watch.is_set());

        let watch = Event::new();
        assert!(c.try_get_watch("/n", &watch).unwrap().is_some());
        c.delete("/n", None).unwrap();
        assert!(watch.is_set());

        // no registration on absent nodes
        let watch = Event::new();
        assert!(c.try_get_watch("/n", &watch).unwrap().is_none());
        c.create("/n", vec![], CreateMode::Persistent).unwrap();
        c.delete("/n", None).unwrap();
        assert!(!watch.is_set());
    }

    #[test]
    fn test_expiry() {
        let c = coordinator();
        c.create("/t", vec![], CreateMode::Persistent).unwrap();
        c.create("/t/alive", vec![], CreateMode::Ephemeral).unwrap();
        c.create("/t/durable", vec![], CreateMode::Persistent)
            .unwrap();

        let watch = Event::new();
        c.try_get_watch("/t/durable", &watch).unwrap();

        c.expire();
        assert!(c.expired());
        assert!(watch.is_set());
        assert_eq!(c.exists("/t").unwrap_err().kind, ErrorKind::SessionExpired);
    }

    #[test]
    fn test_create_ancestors() {
        let c = coordinator();
        create_ancestors(&c, "/a/b/c/leaf").unwrap();
        assert!(c.exists("/a/b/c").unwrap().is_some());
        assert!(c.exists("/a/b/c/leaf").unwrap().is_none());

        // idempotent
        create_ancestors(&c, "/a/b/c/leaf").unwrap();
    }
}
