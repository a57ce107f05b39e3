use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::cluster::StartupError;
use crate::config::NodeDescriptor;

const SEED_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Member records are tens of bytes; anything bigger on the wire is garbage
/// and must not drive the allocation below.
const MAX_MEMBER_FRAME: usize = 16 * 1024;

/// Role a member advertises when joining the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Full member holding replicated state.
    Data,
    /// Probe-only member that joins for discovery but holds no state.
    Client,
}

/// Member record exchanged on the membership channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub role: NodeRole,
    pub ip: String,
    pub socket_port: u16,
}

impl Member {
    pub fn from_descriptor(node: &NodeDescriptor, role: NodeRole) -> Self {
        Self {
            id: node.id.clone(),
            role,
            ip: node.ip.clone(),
            socket_port: node.socket_port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.socket_port)
    }
}

/// Handle to the clustering runtime. Built unstarted, then `start()` blocks
/// until the membership listener is live. Lives for the whole process; there
/// is no shutdown path.
pub struct ClusterRuntime {
    local: Member,
    bootstrap: Vec<Member>,
    metadata_dir: PathBuf,
    rt: Option<tokio::runtime::Runtime>,
    local_addr: Option<SocketAddr>,
}

pub struct RuntimeBuilder {
    local: Option<Member>,
    bootstrap: Vec<Member>,
    metadata_dir: Option<PathBuf>,
}

impl ClusterRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            local: None,
            bootstrap: Vec::new(),
            metadata_dir: None,
        }
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    /// Discovery seeds, local node included.
    pub fn bootstrap_members(&self) -> &[Member] {
        &self.bootstrap
    }

    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    pub fn is_started(&self) -> bool {
        self.rt.is_some()
    }

    /// Address the membership listener actually bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn handle(&self) -> Option<tokio::runtime::Handle> {
        self.rt.as_ref().map(|rt| rt.handle().clone())
    }

    /// Creates the metadata directory, binds the membership listener on the
    /// local endpoint and probes the discovery seeds. Does not return until
    /// the listener is live; startup failures are fatal and not retried here.
    pub fn start(&mut self) -> Result<(), StartupError> {
        fs::create_dir_all(&self.metadata_dir).map_err(|e| StartupError::MetadataDir {
            path: self.metadata_dir.clone(),
            source: e,
        })?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("yfs-cluster")
            .enable_all()
            .build()
            .map_err(StartupError::Runtime)?;

        let addr = self.local.addr();
        let listener = rt
            .block_on(TcpListener::bind(&addr))
            .map_err(|e| StartupError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| StartupError::Bind { addr, source: e })?;
        info!(
            "cluster runtime up as {} ({:?}) on {}",
            self.local.id, self.local.role, local_addr
        );

        rt.spawn(membership_loop(listener, self.local.clone()));

        for seed in &self.bootstrap {
            if seed.id == self.local.id {
                continue;
            }
            rt.spawn(probe_seed(seed.clone(), self.local.clone()));
        }

        self.rt = Some(rt);
        self.local_addr = Some(local_addr);
        Ok(())
    }
}

impl RuntimeBuilder {
    pub fn with_local_node(mut self, node: &NodeDescriptor, role: NodeRole) -> Self {
        self.local = Some(Member::from_descriptor(node, role));
        self
    }

    pub fn with_bootstrap_nodes(mut self, nodes: &[NodeDescriptor]) -> Self {
        self.bootstrap = nodes
            .iter()
            .map(|n| Member::from_descriptor(n, NodeRole::Data))
            .collect();
        self
    }

    pub fn with_metadata_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.metadata_dir = Some(dir.into());
        self
    }

    pub fn build(self) -> Result<ClusterRuntime, StartupError> {
        Ok(ClusterRuntime {
            local: self.local.ok_or(StartupError::NoLocalNode)?,
            bootstrap: self.bootstrap,
            metadata_dir: self.metadata_dir.ok_or(StartupError::NoMetadataDir)?,
            rt: None,
            local_addr: None,
        })
    }
}

/// Frame layout on the membership channel: u32 length, then the member
/// record as JSON.
pub fn encode_member_frame(member: &Member) -> serde_json::Result<BytesMut> {
    let body = serde_json::to_vec(member)?;
    let mut out = BytesMut::with_capacity(4 + body.len());
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    Ok(out)
}

async fn read_member_frame(stream: &mut TcpStream) -> anyhow::Result<Member> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MEMBER_FRAME {
        anyhow::bail!("member frame of {len} bytes exceeds the {MAX_MEMBER_FRAME} byte limit");
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

async fn membership_loop(listener: TcpListener, local: Member) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!("membership connection from {}", peer);
                let local = local.clone();
                tokio::spawn(async move {
                    if let Err(e) = answer_probe(socket, local).await {
                        warn!("membership exchange failed: {:?}", e);
                    }
                });
            }
            Err(e) => {
                warn!("membership accept failed: {:?}", e);
            }
        }
    }
}

async fn answer_probe(mut stream: TcpStream, local: Member) -> anyhow::Result<()> {
    let peer = read_member_frame(&mut stream).await?;
    debug!("probe from member {} ({:?})", peer.id, peer.role);

    let out = encode_member_frame(&local)?;
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Best-effort hello to one discovery seed. Unreachable seeds are expected
/// while the cluster is still coming up.
async fn probe_seed(seed: Member, local: Member) {
    let connect = TcpStream::connect(seed.addr());
    let mut stream = match tokio::time::timeout(SEED_PROBE_TIMEOUT, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("seed {} unreachable: {:?}", seed.id, e);
            return;
        }
        Err(_) => {
            debug!("seed {} probe timed out", seed.id);
            return;
        }
    };

    let exchange = async {
        let out = encode_member_frame(&local)?;
        stream.write_all(&out).await?;
        stream.flush().await?;
        read_member_frame(&mut stream).await
    };
    match tokio::time::timeout(SEED_PROBE_TIMEOUT, exchange).await {
        Ok(Ok(peer)) => debug!("seed {} answered as {}", seed.id, peer.id),
        Ok(Err(e)) => debug!("seed {} handshake failed: {:?}", seed.id, e),
        Err(_) => debug!("seed {} handshake timed out", seed.id),
    }
}
