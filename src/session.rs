//! Collaborators shared by the call and conference managers.

use crate::config::CoreConfig;
use crate::error::CallError;
use crate::ice::IceConfigProvider;
use crate::media::MediaAcquisition;
use crate::peer::{
    CandidateQueue, PeerConnectionEntry, PeerConnectionFactory, PeerConnectionOptions,
    PeerEventSender,
};
use crate::signaling::Signaler;
use crate::timer::{Clock, Scheduler};
use crate::types::PeerId;
use log::debug;
use std::sync::Arc;

/// Everything a manager needs from its host.
#[derive(Clone)]
pub struct SessionContext {
    pub config: CoreConfig,
    pub signaler: Signaler,
    pub ice: Arc<IceConfigProvider>,
    pub media: Arc<dyn MediaAcquisition>,
    pub connections: Arc<dyn PeerConnectionFactory>,
    pub peer_events: PeerEventSender,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
}

impl SessionContext {
    pub fn self_id(&self) -> &PeerId {
        self.signaler.self_id()
    }

    pub(crate) async fn connection_options(&self) -> PeerConnectionOptions {
        PeerConnectionOptions {
            ice_servers: self.ice.ice_servers().await,
            max_bitrate_kbps: self.config.max_bitrate_kbps,
        }
    }

    /// Creates a connection to `peer`, adopting candidates buffered so far.
    pub(crate) async fn open_entry(
        &self,
        peer: &PeerId,
        pending: CandidateQueue,
    ) -> Result<PeerConnectionEntry, CallError> {
        let options = self.connection_options().await;
        let events = self.peer_events.for_peer(peer.clone());
        let connection_id = events.connection_id();
        let connection = self
            .connections
            .create(peer, &options, events)
            .await
            .map_err(|e| CallError::negotiation("create peer connection", e))?;
        debug!(
            "Opened connection {} to {} ({} ICE servers, {} queued candidates)",
            connection_id,
            peer,
            options.ice_servers.len(),
            pending.len()
        );
        Ok(
            PeerConnectionEntry::with_pending(peer.clone(), connection, pending)
                .with_connection_id(connection_id),
        )
    }
}
