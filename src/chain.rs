//! Signed call chains.
//!
//! A call chain records who is calling (`caller`) and on whose behalf
//! (`originators`, oldest first). Chains are issued and signed by the
//! access-control service and addressed to one target login; a server only
//! accepts chains addressed to itself.
//!
//! # Delegation
//!
//! When a service handling a call from `A` joins `A`'s chain and calls `C`,
//! the access-control service issues a new chain for `C` with
//! `originators = A.originators + [A.caller]` and `caller = service`:
//!
//! ```text
//! alice --(chain{caller=alice})--> forwarder --(chain{caller=forwarder, originators=[alice]})--> echo
//! ```

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::crypto::signing::CHAIN_DOMAIN;
use crate::crypto::{sign_bytes, verify_bytes, LoginPublicKey, SigningKey, VerifyingKey};
use crate::error::{BusError, BusResult};
use crate::identity::LoginInfo;

/// Decoded call chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallChain {
    /// Bus that issued the chain.
    pub bus: String,
    /// Login id this chain is addressed to.
    pub target: String,
    /// Identity that directly invokes the operation.
    pub caller: LoginInfo,
    /// Upstream identities, oldest first.
    pub originators: Vec<LoginInfo>,
    /// Caller's login key; servers seal reset challenges to it.
    pub caller_key: LoginPublicKey,
    /// Issue time (unix seconds).
    pub issued_at: i64,
}

impl CallChain {
    /// Chain a login uses before it has joined anything.
    pub fn direct(bus: &str, target: &str, caller: LoginInfo, caller_key: LoginPublicKey) -> Self {
        Self {
            bus: bus.to_string(),
            target: target.to_string(),
            caller,
            originators: Vec::new(),
            caller_key,
            issued_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Chain for `caller` acting on behalf of everyone in `joined`.
    pub fn delegated(joined: &CallChain, target: &str, caller: LoginInfo, caller_key: LoginPublicKey) -> Self {
        let mut originators = joined.originators.clone();
        originators.push(joined.caller.clone());
        Self {
            bus: joined.bus.clone(),
            target: target.to_string(),
            caller,
            originators,
            caller_key,
            issued_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn caller(&self) -> &LoginInfo {
        &self.caller
    }

    pub fn originators(&self) -> &[LoginInfo] {
        &self.originators
    }

    /// Encode and sign with the bus key.
    pub fn sign(&self, bus_key: &SigningKey) -> BusResult<SignedCallChain> {
        let encoded = codec::encode(self)?;
        let signature = sign_bytes(bus_key, CHAIN_DOMAIN, &encoded).to_vec();
        Ok(SignedCallChain { encoded, signature })
    }
}

/// Opaque, signed form of a [`CallChain`], as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedCallChain {
    encoded: Vec<u8>,
    signature: Vec<u8>,
}

impl SignedCallChain {
    /// Verify the bus signature and decode.
    ///
    /// # Errors
    ///
    /// Returns `BusError::InvalidChain` if the signature does not verify
    /// against `bus_key` or the payload does not decode.
    pub fn verify(&self, bus_key: &VerifyingKey) -> BusResult<CallChain> {
        verify_bytes(bus_key, CHAIN_DOMAIN, &self.encoded, &self.signature)
            .map_err(|e| BusError::InvalidChain(e.to_string()))?;
        self.decode_unverified()
    }

    /// Decode without checking the signature. Only for inspecting a chain
    /// this process received from a trusted source (e.g. its own login).
    pub fn decode_unverified(&self) -> BusResult<CallChain> {
        codec::decode(&self.encoded).map_err(|e| BusError::InvalidChain(e.to_string()))
    }

    /// Signature bytes; unique per issued chain.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }
}

/// A chain that has passed verification, as exposed to service handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerChain {
    chain: CallChain,
    signed: SignedCallChain,
}

impl CallerChain {
    /// Verify `signed` with the bus key and wrap it.
    pub fn verified(signed: SignedCallChain, bus_key: &VerifyingKey) -> BusResult<Self> {
        let chain = signed.verify(bus_key)?;
        Ok(Self { chain, signed })
    }

    pub fn bus_id(&self) -> &str {
        &self.chain.bus
    }

    pub fn target(&self) -> &str {
        &self.chain.target
    }

    pub fn caller(&self) -> &LoginInfo {
        &self.chain.caller
    }

    pub fn originators(&self) -> &[LoginInfo] {
        &self.chain.originators
    }

    pub fn chain(&self) -> &CallChain {
        &self.chain
    }

    /// Opaque form, for joining or forwarding.
    pub fn signed(&self) -> &SignedCallChain {
        &self.signed
    }
}
