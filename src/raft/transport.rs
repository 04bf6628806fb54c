use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};

// Use external log crate, not our own log module
use ::log::{debug, info};
use url::{Host, Url};

use super::{RaftError, RaftMessage};

/// Receives messages delivered to a registered node and optionally answers.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: RaftMessage) -> Option<RaftMessage>;
}

/// Delivery of election traffic between the members of a cluster.
pub trait Transport: Send + Sync {
    fn url(&self) -> &str;

    fn register(
        &self,
        cluster: &str,
        node_id: &str,
        handler: Weak<dyn MessageHandler>,
    ) -> Result<(), RaftError>;

    fn deregister(&self, cluster: &str, node_id: &str);

    /// Sends `message` to every other member of `cluster` and collects the
    /// replies, keyed by peer id.
    fn broadcast(
        &self,
        cluster: &str,
        from: &str,
        message: &RaftMessage,
    ) -> Vec<(String, Result<Option<RaftMessage>, RaftError>)>;
}

type Members = HashMap<String, HashMap<String, Weak<dyn MessageHandler>>>;

/// Process-local bus. Every `connect` with the same URL joins the same bus,
/// and messages are framed with bincode as they would be on a socket.
pub struct LocalTransport {
    url: String,
    members: RwLock<Members>,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<LocalTransport>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<LocalTransport>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Parses a transport endpoint. The URL must name a host; domain hosts may
/// only use letters, digits, `-`, `.` and `_`.
pub fn validate_url(raw: &str) -> Result<Url, RaftError> {
    let invalid = || RaftError::InvalidTransportUrl(raw.to_string());

    let url = Url::parse(raw).map_err(|_| invalid())?;
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain_ok = !domain.is_empty()
                && domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'));
            if !domain_ok {
                return Err(invalid());
            }
        }
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {}
        None => return Err(invalid()),
    }
    Ok(url)
}

pub fn encode_message(message: &RaftMessage) -> Result<Vec<u8>, RaftError> {
    bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| RaftError::SerializationError(e.to_string()))
}

pub fn decode_message(bytes: &[u8]) -> Result<RaftMessage, RaftError> {
    let (message, _): (RaftMessage, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;
    Ok(message)
}

impl LocalTransport {
    pub fn connect(url: &str) -> Result<Arc<Self>, RaftError> {
        validate_url(url)?;

        let mut buses = registry()
            .lock()
            .map_err(|_| RaftError::NetworkError("transport registry poisoned".to_string()))?;

        if let Some(existing) = buses.get(url).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        // Buses whose nodes have all gone away.
        buses.retain(|_, bus| bus.strong_count() > 0);

        info!("Connected local transport at {url}");
        let transport = Arc::new(Self {
            url: url.to_string(),
            members: RwLock::new(HashMap::new()),
        });
        buses.insert(url.to_string(), Arc::downgrade(&transport));
        Ok(transport)
    }

    pub fn members(&self, cluster: &str) -> Vec<String> {
        let members = match self.members.read() {
            Ok(m) => m,
            Err(_) => return Vec::new(),
        };
        let mut ids: Vec<String> = members
            .get(cluster)
            .map(|nodes| {
                nodes
                    .iter()
                    .filter(|(_, h)| h.strong_count() > 0)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn deliver(handler: &dyn MessageHandler, frame: &[u8]) -> Result<Option<RaftMessage>, RaftError> {
        let message = decode_message(frame)?;
        match handler.handle_message(message) {
            Some(reply) => {
                let reply_frame = encode_message(&reply)?;
                decode_message(&reply_frame).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl Transport for LocalTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn register(
        &self,
        cluster: &str,
        node_id: &str,
        handler: Weak<dyn MessageHandler>,
    ) -> Result<(), RaftError> {
        let mut members = self
            .members
            .write()
            .map_err(|_| RaftError::NetworkError("transport members poisoned".to_string()))?;

        let nodes = members.entry(cluster.to_string()).or_default();
        if let Some(existing) = nodes.get(node_id) {
            if existing.strong_count() > 0 {
                return Err(RaftError::NetworkError(format!(
                    "node {node_id} already registered in cluster {cluster}"
                )));
            }
        }
        nodes.insert(node_id.to_string(), handler);
        debug!("Registered node {node_id} in cluster {cluster}");
        Ok(())
    }

    fn deregister(&self, cluster: &str, node_id: &str) {
        if let Ok(mut members) = self.members.write() {
            if let Some(nodes) = members.get_mut(cluster) {
                nodes.remove(node_id);
                if nodes.is_empty() {
                    members.remove(cluster);
                }
            }
        }
        debug!("Deregistered node {node_id} from cluster {cluster}");
    }

    fn broadcast(
        &self,
        cluster: &str,
        from: &str,
        message: &RaftMessage,
    ) -> Vec<(String, Result<Option<RaftMessage>, RaftError>)> {
        let frame = match encode_message(message) {
            Ok(frame) => frame,
            Err(e) => return vec![(from.to_string(), Err(e))],
        };

        // Snapshot the peers so no transport lock is held while a peer runs
        // its handler.
        let peers: Vec<(String, Weak<dyn MessageHandler>)> = match self.members.read() {
            Ok(members) => members
                .get(cluster)
                .map(|nodes| {
                    nodes
                        .iter()
                        .filter(|(id, _)| id.as_str() != from)
                        .map(|(id, h)| (id.clone(), h.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        };

        peers
            .into_iter()
            .map(|(peer_id, handler)| {
                let result = match handler.upgrade() {
                    Some(handler) => Self::deliver(handler.as_ref(), &frame),
                    None => Err(RaftError::NetworkError(format!("peer {peer_id} is gone"))),
                };
                (peer_id, result)
            })
            .collect()
    }
}
