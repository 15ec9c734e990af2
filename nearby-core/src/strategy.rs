//! Connection topology strategies.

use serde::{Deserialize, Serialize};

use crate::error::NearbyError;

/// Topology constraint shared by advertiser and discoverer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    /// Many-to-many.
    Cluster,
    /// One hub (advertiser), many spokes (discoverers).
    Star,
    /// Exactly one connection.
    PointToPoint,
}

/// Which side of a connection we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We sent the connection request (we discovered the peer).
    Requester,
    /// We received the connection request (the peer discovered us).
    Responder,
}

impl Strategy {
    /// Numeric strategy id as written in config files: 0 cluster, 1 star, 2 point-to-point.
    pub fn from_id(id: u32) -> Result<Self, NearbyError> {
        match id {
            0 => Ok(Strategy::Cluster),
            1 => Ok(Strategy::Star),
            2 => Ok(Strategy::PointToPoint),
            _ => Err(NearbyError::InvalidArgument(format!(
                "strategy id must be between 0 and 2, got {id}"
            ))),
        }
    }

    /// Whether one more connection in `role` is allowed, given the live
    /// (non-terminal) connection counts per role.
    pub fn allows_connection(self, role: Role, requesters: usize, responders: usize) -> bool {
        match self {
            Strategy::Cluster => true,
            Strategy::PointToPoint => requesters + responders == 0,
            // A spoke talks to one hub only; the hub accepts any number of spokes.
            Strategy::Star => match role {
                Role::Requester => requesters == 0,
                Role::Responder => true,
            },
        }
    }
}
