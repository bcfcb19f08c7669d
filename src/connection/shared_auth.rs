//! Shared-authentication secrets.
//!
//! A logged-in process can hand a one-time (or single sign-on) login to
//! another process. The secret travels as an opaque blob, typically through
//! a file that the receiving process reads once and deletes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

use crate::access_control::HandoffMode;
use crate::codec;
use crate::crypto::Secret;
use crate::error::{BusError, BusResult};

const MAGIC: [u8; 4] = *b"BSA1";

#[derive(Serialize, Deserialize)]
struct EncodedSecret {
    magic: [u8; 4],
    bus_id: String,
    process: String,
    secret: [u8; 32],
    mode: HandoffMode,
}

impl Drop for EncodedSecret {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.secret);
    }
}

/// Secret that lets another process log in as the same entity.
#[derive(Clone)]
pub struct SharedAuthSecret {
    bus_id: String,
    process: String,
    secret: Secret,
    mode: HandoffMode,
}

impl SharedAuthSecret {
    pub fn new(bus_id: String, process: String, secret: Secret, mode: HandoffMode) -> Self {
        Self {
            bus_id,
            process,
            secret,
            mode,
        }
    }

    pub fn bus_id(&self) -> &str {
        &self.bus_id
    }

    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn mode(&self) -> HandoffMode {
        self.mode
    }

    /// Encode to the opaque handoff format.
    pub fn encode(&self) -> BusResult<Zeroizing<Vec<u8>>> {
        let encoded = EncodedSecret {
            magic: MAGIC,
            bus_id: self.bus_id.clone(),
            process: self.process.clone(),
            secret: *self.secret.as_bytes(),
            mode: self.mode,
        };
        Ok(Zeroizing::new(codec::encode(&encoded)?))
    }

    /// Decode the opaque handoff format.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidSharedAuth` for anything that is not a
    /// secret produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        let decoded: EncodedSecret = codec::decode(bytes)
            .map_err(|e| BusError::InvalidSharedAuth(format!("malformed secret: {e}")))?;
        if decoded.magic != MAGIC {
            return Err(BusError::InvalidSharedAuth("bad magic".into()));
        }
        Ok(Self {
            bus_id: decoded.bus_id.clone(),
            process: decoded.process.clone(),
            secret: Secret::from_bytes(decoded.secret),
            mode: decoded.mode,
        })
    }

    /// Write the encoded secret to `path`, readable by the owner only.
    pub fn write_to(&self, path: &Path) -> BusResult<()> {
        use std::io::Write;

        let encoded = self.encode()?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;
        debug!(path = %path.display(), process = %self.process, "shared auth secret written");
        Ok(())
    }

    /// Read a secret written by [`write_to`](Self::write_to) and delete the
    /// file.
    ///
    /// The file is removed even if it does not decode.
    pub fn consume(path: &Path) -> BusResult<Self> {
        let bytes = Zeroizing::new(std::fs::read(path)?);
        std::fs::remove_file(path)?;
        debug!(path = %path.display(), "shared auth secret consumed");
        Self::decode(&bytes)
    }
}

impl std::fmt::Debug for SharedAuthSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAuthSecret")
            .field("bus_id", &self.bus_id)
            .field("process", &self.process)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
