//! Error taxonomy for protocol operations.

use alloy::primitives::{Address, U256};
use thiserror::Error;

use crate::u256_math::MathError;

/// Why the risk engine refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DenyReason {
    #[error("market not listed")]
    MarketNotListed,
    #[error("market paused")]
    MarketPaused,
    #[error("insufficient collateral")]
    InsufficientCollateral,
    #[error("borrow cap exceeded")]
    BorrowCapExceeded,
    #[error("supply cap exceeded")]
    SupplyCapExceeded,
    #[error("price unavailable")]
    PriceUnavailable,
    #[error("account has no shortfall")]
    InsufficientShortfall,
    #[error("repay amount above close factor")]
    TooMuchRepay,
    #[error("liquidator is the borrower")]
    SelfLiquidation,
    #[error("markets belong to different risk engines")]
    ControllerMismatch,
}

/// Failure of a protocol operation. Every failure leaves state untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("authorization denied: {0}")]
    AuthorizationDenied(DenyReason),

    #[error("insufficient market cash")]
    InsufficientLiquidity,

    #[error("token transfer failed: {0}")]
    TransferFailure(String),

    #[error("seize amount exceeds borrower collateral")]
    SeizeTooMuch,

    #[error("insufficient proceeds: needed {needed}, got {got}")]
    InsufficientProceeds { needed: U256, got: U256 },

    #[error("nonzero balance")]
    NonzeroBalance,

    #[error("insufficient balance")]
    InsufficientBalance,

    #[error("invalid amount")]
    InvalidAmount,

    #[error("unknown market {0}")]
    UnknownMarket(Address),

    #[error("unknown asset {0}")]
    UnknownAsset(Address),

    #[error("market {0} already listed")]
    MarketAlreadyListed(Address),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("borrow rate above maximum")]
    BorrowRateTooHigh,

    #[error("flash loan not repaid")]
    FlashLoanNotRepaid,

    #[error("reentrant call")]
    Reentrancy,

    #[error("swap failed: {0}")]
    SwapFailed(String),

    #[error("math overflow")]
    MathOverflow,
}

impl ProtocolError {
    /// The deny reason, if this is an authorization failure.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::AuthorizationDenied(reason) => Some(*reason),
            _ => None,
        }
    }

    pub(crate) fn proceeds(needed: U256, got: U256) -> Self {
        Self::InsufficientProceeds { needed, got }
    }
}

impl From<DenyReason> for ProtocolError {
    fn from(reason: DenyReason) -> Self {
        Self::AuthorizationDenied(reason)
    }
}

impl From<MathError> for ProtocolError {
    fn from(_: MathError) -> Self {
        Self::MathOverflow
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
