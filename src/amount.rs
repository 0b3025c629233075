//! Token amounts bound to a token identity
//!
//! Values are kept as human decimals. Atomic integers only exist at the edge,
//! and converting to or from them always names the ecosystem whose decimals
//! apply.

use crate::catalog::{EcosystemId, TokenSpec};
use crate::error::{OrchestratorError, OrchestratorResult};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Precision the bridge normalizes transferred amounts to
pub const BRIDGE_MAX_DECIMALS: u32 = 8;

#[derive(Clone)]
pub struct Amount {
    token: Arc<TokenSpec>,
    value: Decimal,
}

impl Amount {
    pub fn from_human(token: Arc<TokenSpec>, value: Decimal) -> Self {
        Self { token, value }
    }

    pub fn from_human_str(token: Arc<TokenSpec>, value: &str) -> OrchestratorResult<Self> {
        let value = Decimal::from_str(value).map_err(|e| {
            OrchestratorError::Serialization(format!("invalid amount {:?}: {}", value, e))
        })?;
        Ok(Self { token, value })
    }

    pub fn zero(token: Arc<TokenSpec>) -> Self {
        Self {
            token,
            value: Decimal::ZERO,
        }
    }

    /// Interpret an atomic integer with the token's decimals on `ecosystem`
    pub fn from_atomic(
        token: Arc<TokenSpec>,
        atomic: u128,
        ecosystem: EcosystemId,
    ) -> OrchestratorResult<Self> {
        let decimals = decimals_on(&token, ecosystem)?;
        let atomic = i128::try_from(atomic)
            .map_err(|_| OrchestratorError::Internal(format!("atomic amount {} overflows", atomic)))?;
        let value = Decimal::try_from_i128_with_scale(atomic, decimals)
            .map_err(|e| OrchestratorError::Internal(format!("atomic amount {}: {}", atomic, e)))?;
        Ok(Self {
            token,
            value: value.normalize(),
        })
    }

    /// Atomic integer using the token's decimals on `ecosystem`
    pub fn to_atomic(&self, ecosystem: EcosystemId) -> OrchestratorResult<u128> {
        if self.value.is_sign_negative() && !self.value.is_zero() {
            return Err(OrchestratorError::Internal(format!(
                "negative amount {} of {}",
                self.value, self.token.id
            )));
        }
        let decimals = decimals_on(&self.token, ecosystem)?;
        let scale = Decimal::from(10u64.pow(decimals));
        let scaled = self.value.checked_mul(scale).ok_or_else(|| {
            OrchestratorError::Internal(format!("amount {} of {} overflows", self.value, self.token.id))
        })?;
        if !scaled.fract().is_zero() {
            return Err(OrchestratorError::Internal(format!(
                "amount {} of {} exceeds {} decimals on {}",
                self.value, self.token.id, decimals, ecosystem
            )));
        }
        scaled.trunc().to_u128().ok_or_else(|| {
            OrchestratorError::Internal(format!("amount {} of {} overflows", self.value, self.token.id))
        })
    }

    /// The part of this amount that survives bridging from `source` to
    /// `destination`: truncated to the coarsest precision along the way
    pub fn bridgeable(
        &self,
        source: EcosystemId,
        destination: EcosystemId,
    ) -> OrchestratorResult<Self> {
        let precision = BRIDGE_MAX_DECIMALS
            .min(decimals_on(&self.token, source)?)
            .min(decimals_on(&self.token, destination)?);
        Ok(Self {
            token: self.token.clone(),
            value: self
                .value
                .round_dp_with_strategy(precision, RoundingStrategy::ToZero),
        })
    }

    pub fn token(&self) -> &Arc<TokenSpec> {
        &self.token
    }

    pub fn token_id(&self) -> &str {
        &self.token.id
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    /// Human decimal string, as persisted
    pub fn to_human_string(&self) -> String {
        self.value.to_string()
    }
}

fn decimals_on(token: &TokenSpec, ecosystem: EcosystemId) -> OrchestratorResult<u32> {
    token
        .details_on(ecosystem)
        .map(|d| d.decimals)
        .ok_or_else(|| {
            OrchestratorError::InvalidRoute(format!(
                "token {} is not available on {}",
                token.id, ecosystem
            ))
        })
}

impl PartialEq for Amount {
    fn eq(&self, other: &Self) -> bool {
        self.token.id == other.token.id && self.value == other.value
    }
}

impl Eq for Amount {}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({} {})", self.value, self.token.id)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.token.symbol)
    }
}
