use crate::common::{Result, RidgelineError};

/// Opaque per-connection handle. The transport layer maps its own notion of
/// a caller (bus name, socket peer) onto one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimOwner {
    pub identity: String,
    pub conn: ConnId,
}

/// Pure claim state machine for one device: at most one owner, busy only
/// while claimed, suspended as an orthogonal overlay. All transitions are
/// driven by the device scheduler; this struct never blocks.
#[derive(Debug, Default)]
pub struct SessionState {
    owner: Option<ClaimOwner>,
    busy: bool,
    suspended: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(&self) -> Option<&ClaimOwner> {
        self.owner.as_ref()
    }

    pub fn is_claimed(&self) -> bool {
        self.owner.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn claim(&mut self, identity: &str, conn: ConnId) -> Result<()> {
        if self.owner.is_some() {
            return Err(RidgelineError::AlreadyInUse);
        }
        self.owner = Some(ClaimOwner {
            identity: identity.to_string(),
            conn,
        });
        Ok(())
    }

    /// Error unless `conn` holds the claim.
    pub fn require_claim(&self, conn: ConnId) -> Result<&ClaimOwner> {
        match &self.owner {
            Some(owner) if owner.conn == conn => Ok(owner),
            _ => Err(RidgelineError::ClaimRequired),
        }
    }

    pub fn release(&mut self, conn: ConnId) -> Result<ClaimOwner> {
        self.require_claim(conn)?;
        self.busy = false;
        Ok(self.owner.take().expect("claim checked above"))
    }

    /// Unconditional release, for disconnects. None when nothing was held.
    pub fn force_release(&mut self) -> Option<ClaimOwner> {
        self.busy = false;
        self.owner.take()
    }

    pub fn set_busy(&mut self, busy: bool) {
        debug_assert!(!busy || self.owner.is_some(), "busy requires a claim");
        self.busy = busy;
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }
}
