use std::{fmt::Display, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use containers::{
    Bytes32, FullBlock, HeaderBlock, Height, NodeType, ProtocolMessage, UnfinishedBlock,
    WeightProof,
};
use fork_choice::BlockSource;
use libp2p_identity::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

/// Request side of the peer protocol.
///
/// `Err` is a connectivity failure; `Ok(None)` is the peer rejecting the
/// request. Callers bound every request with a timeout.
#[async_trait]
pub trait NetworkRequester: Send + Sync + 'static {
    async fn request_block(
        &self,
        peer_id: PeerId,
        height: Height,
        include_transactions: bool,
    ) -> Result<Option<FullBlock>>;

    /// Blocks `start..=end`, ascending.
    async fn request_blocks(
        &self,
        peer_id: PeerId,
        start: Height,
        end: Height,
        include_transactions: bool,
    ) -> Result<Option<Vec<FullBlock>>>;

    async fn request_block_header(
        &self,
        peer_id: PeerId,
        height: Height,
    ) -> Result<Option<HeaderBlock>>;

    async fn request_proof_of_weight(
        &self,
        peer_id: PeerId,
        total_number_of_blocks: Height,
        tip: Bytes32,
    ) -> Result<Option<WeightProof>>;

    fn connected_peers(&self, node_type: NodeType) -> Vec<PeerId>;

    /// Disconnects the peer; a non-zero `ban` refuses reconnection for that
    /// long.
    async fn close_peer(&self, peer_id: PeerId, ban: Duration);
}

/// Fan-out of protocol messages to every connection of one node type.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_to_all(&self, message: ProtocolMessage, node_type: NodeType) -> Result<()>;

    async fn send_to_all_except(
        &self,
        message: ProtocolMessage,
        node_type: NodeType,
        except: PeerId,
    ) -> Result<()>;
}

/// Messages delivered to the node by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMessage {
    NewPeak {
        peer_id: PeerId,
        peak: containers::NewPeak,
    },
    RespondBlock {
        peer_id: PeerId,
        block: FullBlock,
    },
    RespondUnfinishedBlock {
        peer_id: PeerId,
        block: UnfinishedBlock,
    },
    NewInfusionPointVdf {
        peer_id: Option<PeerId>,
        vdf: containers::NewInfusionPointVdf,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
}

impl Display for NodeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeMessage::NewPeak { peer_id, peak } => {
                write!(f, "NewPeak(height={}, peer={peer_id})", peak.height)
            }
            NodeMessage::RespondBlock { peer_id, block } => {
                write!(f, "RespondBlock(height={}, peer={peer_id})", block.height())
            }
            NodeMessage::RespondUnfinishedBlock { peer_id, block } => write!(
                f,
                "RespondUnfinishedBlock(rh={}, peer={peer_id})",
                block.partial_hash()
            ),
            NodeMessage::NewInfusionPointVdf { vdf, .. } => {
                write!(f, "NewInfusionPointVdf(rh={})", vdf.unfinished_reward_hash)
            }
            NodeMessage::PeerDisconnected { peer_id } => {
                write!(f, "PeerDisconnected(peer={peer_id})")
            }
        }
    }
}

#[async_trait]
pub trait MessageSource<T>: Send {
    async fn recv(&mut self) -> Option<T>;
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for mpsc::UnboundedReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for mpsc::Receiver<T> {
    async fn recv(&mut self) -> Option<T> {
        mpsc::Receiver::recv(self).await
    }
}

/// A peer acting as the origin of a block, so admission can re-fetch it.
pub struct PeerBlockSource<'a, N: NetworkRequester> {
    pub network: &'a N,
    pub peer_id: PeerId,
    pub timeout: Duration,
}

#[async_trait]
impl<N: NetworkRequester> BlockSource for PeerBlockSource<'_, N> {
    async fn fetch_block(&self, height: Height, include_transactions: bool) -> Option<FullBlock> {
        let request = self
            .network
            .request_block(self.peer_id, height, include_transactions);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(block)) => block,
            Ok(Err(err)) => {
                debug!(peer = %self.peer_id, height, %err, "Block re-fetch failed");
                None
            }
            Err(_) => {
                debug!(peer = %self.peer_id, height, "Block re-fetch timed out");
                None
            }
        }
    }
}
