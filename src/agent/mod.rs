#[cfg(test)]
mod agent_conncheck_test;
#[cfg(test)]
mod agent_gather_test;
#[cfg(test)]
mod agent_test;

pub mod agent_config;
pub(crate) mod agent_conncheck;
pub(crate) mod agent_dispatch;
pub(crate) mod agent_gather;
pub(crate) mod agent_internal;
pub(crate) mod agent_keepalive;
pub(crate) mod agent_selector;
pub mod agent_stats;
pub mod agent_transport;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, oneshot, Mutex};

use agent_config::AgentConfig;
use agent_internal::{AgentInternal, Cmd};

use crate::candidate::{Candidate, RemoteCandidate, RelayType, TransportType};
use crate::error::*;
use crate::state::ComponentState;
use crate::stats::{CandidatePairStats, CandidateStats, ComponentStats};
use crate::stream::{DataPacket, PortRange};

/// Everything the agent reports back to the embedder, in mutation order.
#[derive(Clone, Debug)]
pub enum AgentEvent {
    /// Gathering finished for the stream; every `NewCandidate` for it has
    /// already been delivered.
    CandidateGatheringDone { stream_id: u32 },
    ComponentStateChanged {
        stream_id: u32,
        component_id: u16,
        state: ComponentState,
    },
    NewCandidate {
        stream_id: u32,
        component_id: u16,
        foundation: String,
    },
    /// A peer-reflexive remote candidate was learned from an inbound
    /// check.
    NewRemoteCandidate {
        stream_id: u32,
        component_id: u16,
        foundation: String,
    },
    NewSelectedPair {
        stream_id: u32,
        component_id: u16,
        local: CandidateStats,
        remote: CandidateStats,
    },
    /// The first authenticated binding request of the session arrived.
    InitialBindingRequestReceived { stream_id: u32 },
    ReliableTransportWritable {
        stream_id: u32,
        component_id: u16,
    },
    ReliableTransportOverflow {
        stream_id: u32,
        component_id: u16,
    },
    /// A TURN allocation could not be created or kept alive.
    TurnAllocationFailed {
        stream_id: u32,
        component_id: u16,
        server: SocketAddr,
    },
}

/// The selected pair of one component, readable without entering the
/// agent task.
#[derive(Clone, Debug)]
pub struct SelectedPair {
    pub stream_id: u32,
    pub component_id: u16,
    pub local: CandidateStats,
    pub remote: CandidateStats,
    pub priority: u64,
}

pub(crate) type SelectedPairs = Arc<ArcSwapOption<Vec<SelectedPair>>>;

/// Represents the ICE agent: a thin handle posting commands into the
/// single-threaded agent task and reading events back out.
pub struct Agent {
    cmd_tx: mpsc::Sender<Cmd>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentEvent>>>,
    selected_pairs: SelectedPairs,
}

impl Agent {
    /// Creates a new agent and spawns its task.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let selected_pairs: SelectedPairs = Arc::new(ArcSwapOption::empty());

        let internal = AgentInternal::new(&config, event_tx, Arc::clone(&selected_pairs));
        tokio::spawn(internal.run(cmd_rx));

        Ok(Self {
            cmd_tx,
            event_rx: Mutex::new(Some(event_rx)),
            selected_pairs,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Cmd,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::ErrClosed)?;
        rx.await.map_err(|_| Error::ErrClosed)
    }

    /// Takes the event stream. Events are emitted in the order the agent
    /// applied the corresponding mutations.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AgentEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Adds a stream of `n_components` components and returns its id.
    pub async fn add_stream(&self, n_components: u16) -> Result<u32> {
        self.request(|reply| Cmd::AddStream {
            n_components,
            reply,
        })
        .await
    }

    /// Removes the stream, pruning its checks, discoveries, refreshes
    /// and sockets.
    pub async fn remove_stream(&self, stream_id: u32) -> Result<()> {
        self.request(|reply| Cmd::RemoveStream { stream_id, reply })
            .await?
    }

    /// Adds a local address host candidates are gathered on.
    pub async fn add_local_address(&self, ip: IpAddr) -> Result<()> {
        self.request(|reply| Cmd::AddLocalAddress { ip, reply }).await?
    }

    /// Constrains the UDP host candidate port range of a component.
    pub async fn set_port_range(
        &self,
        stream_id: u32,
        component_id: u16,
        min_port: u16,
        max_port: u16,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetPortRange {
            stream_id,
            component_id,
            range: PortRange {
                min: min_port,
                max: max_port,
            },
            tcp_active: false,
            reply,
        })
        .await?
    }

    /// Constrains the local port range of outgoing TCP connections.
    pub async fn set_tcp_active_port_range(
        &self,
        stream_id: u32,
        component_id: u16,
        min_port: u16,
        max_port: u16,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetPortRange {
            stream_id,
            component_id,
            range: PortRange {
                min: min_port,
                max: max_port,
            },
            tcp_active: true,
            reply,
        })
        .await?
    }

    /// Enables or disables one transport on a component.
    pub async fn set_transport(
        &self,
        stream_id: u32,
        component_id: u16,
        transport: TransportType,
        enabled: bool,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetTransport {
            stream_id,
            component_id,
            transport,
            enabled,
            reply,
        })
        .await?
    }

    /// Configures a TURN server for a component.
    pub async fn set_relay_info(
        &self,
        stream_id: u32,
        component_id: u16,
        server: SocketAddr,
        username: &str,
        password: &str,
        relay_type: RelayType,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetRelayInfo {
            stream_id,
            component_id,
            server,
            username: username.to_owned(),
            password: password.to_owned(),
            relay_type,
            reply,
        })
        .await?
    }

    /// Configures the STUN server used for server-reflexive discovery on
    /// a component.
    pub async fn set_stun_info(
        &self,
        stream_id: u32,
        component_id: u16,
        server: SocketAddr,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetStunInfo {
            stream_id,
            component_id,
            server,
            reply,
        })
        .await?
    }

    /// Overrides the stream's generated local credentials.
    pub async fn set_local_credentials(
        &self,
        stream_id: u32,
        ufrag: &str,
        pwd: &str,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetLocalCredentials {
            stream_id,
            ufrag: ufrag.to_owned(),
            pwd: pwd.to_owned(),
            reply,
        })
        .await?
    }

    /// Sets the credentials of the remote agent. Empty values are
    /// accepted for interoperability.
    pub async fn set_remote_credentials(
        &self,
        stream_id: u32,
        ufrag: &str,
        pwd: &str,
    ) -> Result<()> {
        self.request(|reply| Cmd::SetRemoteCredentials {
            stream_id,
            ufrag: ufrag.to_owned(),
            pwd: pwd.to_owned(),
            reply,
        })
        .await?
    }

    /// Returns the stream's local credentials.
    pub async fn get_local_credentials(&self, stream_id: u32) -> Result<(String, String)> {
        self.request(|reply| Cmd::GetLocalCredentials { stream_id, reply })
            .await?
    }

    /// Starts gathering host, server-reflexive and relayed candidates
    /// for the stream.
    pub async fn gather_candidates(&self, stream_id: u32) -> Result<bool> {
        self.request(|reply| Cmd::GatherCandidates { stream_id, reply })
            .await?
    }

    /// Returns the local candidates gathered so far.
    pub async fn get_local_candidates(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<Vec<Candidate>> {
        self.request(|reply| Cmd::GetLocalCandidates {
            stream_id,
            component_id,
            reply,
        })
        .await?
    }

    /// Adds remote candidates; returns how many were actually added
    /// after de-duplication and the per-component cap.
    pub async fn set_remote_candidates(
        &self,
        stream_id: u32,
        component_id: u16,
        candidates: Vec<RemoteCandidate>,
    ) -> Result<i32> {
        self.request(|reply| Cmd::SetRemoteCandidates {
            stream_id,
            component_id,
            candidates,
            reply,
        })
        .await?
    }

    /// Marks the peer's gathering as finished for the component,
    /// letting the check list conclude.
    pub async fn end_of_candidates(&self, stream_id: u32, component_id: u16) -> Result<()> {
        self.request(|reply| Cmd::EndOfCandidates {
            stream_id,
            component_id,
            reply,
        })
        .await?
    }

    /// Binds the application receive sink of a component. Inbound
    /// non-STUN traffic is delivered there with its source address.
    pub async fn attach_recv(
        &self,
        stream_id: u32,
        component_id: u16,
    ) -> Result<mpsc::UnboundedReceiver<DataPacket>> {
        self.request(|reply| Cmd::AttachRecv {
            stream_id,
            component_id,
            reply,
        })
        .await?
    }

    /// Sends application data over the selected pair.
    pub async fn send(&self, stream_id: u32, component_id: u16, data: &[u8]) -> Result<usize> {
        self.request(|reply| Cmd::Send {
            stream_id,
            component_id,
            data: data.to_vec(),
            reply,
        })
        .await?
    }

    /// Forces the selected pair by candidate foundations and disables
    /// further ICE processing on the component.
    pub async fn set_selected_pair(
        &self,
        stream_id: u32,
        component_id: u16,
        local_foundation: &str,
        remote_foundation: &str,
    ) -> Result<bool> {
        self.request(|reply| Cmd::SetSelectedPair {
            stream_id,
            component_id,
            local_foundation: local_foundation.to_owned(),
            remote_foundation: remote_foundation.to_owned(),
            reply,
        })
        .await?
    }

    /// Forces the remote side of the selection; the best local candidate
    /// towards it is picked by the agent.
    pub async fn set_selected_remote_candidate(
        &self,
        stream_id: u32,
        component_id: u16,
        remote: RemoteCandidate,
    ) -> Result<bool> {
        self.request(|reply| Cmd::SetSelectedRemoteCandidate {
            stream_id,
            component_id,
            remote,
            reply,
        })
        .await?
    }

    /// Restarts every stream: fresh credentials and tie-breaker, all
    /// candidate state reset. The selected pairs keep carrying media.
    pub async fn restart(&self) -> Result<bool> {
        self.request(|reply| Cmd::Restart { reply }).await?
    }

    /// Restarts a single stream, keeping the agent tie-breaker.
    pub async fn restart_stream(&self, stream_id: u32) -> Result<bool> {
        self.request(|reply| Cmd::RestartStream { stream_id, reply })
            .await?
    }

    pub async fn set_rtcp_mux(&self, stream_id: u32, rtcp_mux: bool) -> Result<()> {
        self.request(|reply| Cmd::SetStreamRtcpMux {
            stream_id,
            rtcp_mux,
            reply,
        })
        .await?
    }

    pub async fn set_trickle_ice(&self, stream_id: u32, trickle: bool) -> Result<()> {
        self.request(|reply| Cmd::SetStreamTrickleIce {
            stream_id,
            trickle,
            reply,
        })
        .await?
    }

    /// Sets the diffserv ToS applied to the stream's traffic.
    pub async fn set_stream_tos(&self, stream_id: u32, tos: u8) -> Result<()> {
        self.request(|reply| Cmd::SetStreamTos {
            stream_id,
            tos,
            reply,
        })
        .await?
    }

    /// Bounds the per-connection outbound packet queue of the stream's
    /// TCP sockets.
    pub async fn set_max_tcp_queue_size(&self, stream_id: u32, size: usize) -> Result<()> {
        self.request(|reply| Cmd::SetStreamMaxTcpQueueSize {
            stream_id,
            size,
            reply,
        })
        .await?
    }

    /// The selected pair of a component, if any, without a task
    /// round-trip.
    pub fn get_selected_pair(&self, stream_id: u32, component_id: u16) -> Option<SelectedPair> {
        let snapshot = self.selected_pairs.load();
        snapshot.as_ref().and_then(|pairs| {
            pairs
                .iter()
                .find(|p| p.stream_id == stream_id && p.component_id == component_id)
                .cloned()
        })
    }

    /// Returns a list of candidate pair stats.
    pub async fn get_candidate_pairs_stats(&self) -> Result<Vec<CandidatePairStats>> {
        self.request(|reply| Cmd::GetPairStats { reply }).await
    }

    /// Returns a list of local candidate stats.
    pub async fn get_local_candidates_stats(&self) -> Result<Vec<CandidateStats>> {
        self.request(|reply| Cmd::GetCandidateStats {
            remote: false,
            reply,
        })
        .await
    }

    /// Returns a list of remote candidate stats.
    pub async fn get_remote_candidates_stats(&self) -> Result<Vec<CandidateStats>> {
        self.request(|reply| Cmd::GetCandidateStats {
            remote: true,
            reply,
        })
        .await
    }

    /// Returns per-component connectivity snapshots.
    pub async fn get_component_stats(&self) -> Result<Vec<ComponentStats>> {
        self.request(|reply| Cmd::GetComponentStats { reply }).await
    }

    /// Cleans up the agent: all streams removed, sockets closed, the
    /// agent task terminated.
    pub async fn close(&self) -> Result<()> {
        self.request(|reply| Cmd::Close { reply }).await
    }
}
