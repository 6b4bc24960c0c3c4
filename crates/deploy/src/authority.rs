//! Resolution of who may mutate a contract.
//!
//! Proxies report an admin in their EIP-1967 admin slot. An admin without
//! code is an externally-owned account and acts directly; an admin with code
//! is a ProxyAdmin-style contract whose own owner acts through it.

use std::future::Future;

use alloy_core::primitives::Address;
use anyhow::Result;

use crate::chain::{self, ChainClient};
use crate::contracts::IOwnable;
use crate::proxy;

/// The account that may mutate a contract, and how it does so.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// The account itself is the admin/owner.
    Direct(Address),
    /// Changes go through `admin`, a contract owned by `owner`.
    Indirect { admin: Address, owner: Address },
}

impl Authority {
    /// The externally-owned account that ultimately holds authority.
    pub fn controller(&self) -> Address {
        match self {
            Self::Direct(account) => *account,
            Self::Indirect { owner, .. } => *owner,
        }
    }

    pub fn is_held_by(&self, signer: Address) -> bool {
        self.controller() == signer
    }
}

/// Result of an action gated on authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityOutcome<T> {
    Applied(T),
    /// The signer does not hold authority; nothing was sent.
    NotAuthorized { signer: Address, authority: Address },
}

impl<T> AuthorityOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Resolve the authority over a transparent proxy.
pub async fn resolve_proxy_authority<C: ChainClient>(client: &C, proxy: Address) -> Result<Authority> {
    let admin = proxy::admin_of(client, proxy).await?;

    if !chain::has_code(client, admin).await? {
        return Ok(Authority::Direct(admin));
    }

    let owner = read_owner(client, admin).await?;
    Ok(Authority::Indirect { admin, owner })
}

/// Current `owner()` of an ownable contract.
pub async fn read_owner<C: ChainClient>(client: &C, contract: Address) -> Result<Address> {
    Ok(chain::read(client, contract, IOwnable::ownerCall {}).await?._0)
}

/// Run `direct` or `indirect` depending on `authority`, if the signer holds it.
///
/// A mismatch is logged and reported, never raised.
pub async fn run_with_authority<C, T, D, DF, I, IF>(
    client: &C,
    contract: Address,
    authority: Authority,
    direct: D,
    indirect: I,
) -> Result<AuthorityOutcome<T>>
where
    C: ChainClient,
    D: FnOnce() -> DF,
    DF: Future<Output = Result<T>>,
    I: FnOnce(Address) -> IF,
    IF: Future<Output = Result<T>>,
{
    let signer = client.signer_address();

    if !authority.is_held_by(signer) {
        return Ok(not_authorized(contract, signer, authority.controller()));
    }

    let value = match authority {
        Authority::Direct(_) => direct().await?,
        Authority::Indirect { admin, .. } => indirect(admin).await?,
    };
    Ok(AuthorityOutcome::Applied(value))
}

/// Resolve the authority over `proxy` and run the matching action.
pub async fn resolve_and_run<C, T, D, DF, I, IF>(
    client: &C,
    proxy: Address,
    direct: D,
    indirect: I,
) -> Result<AuthorityOutcome<T>>
where
    C: ChainClient,
    D: FnOnce() -> DF,
    DF: Future<Output = Result<T>>,
    I: FnOnce(Address) -> IF,
    IF: Future<Output = Result<T>>,
{
    let authority = resolve_proxy_authority(client, proxy).await?;
    run_with_authority(client, proxy, authority, direct, indirect).await
}

/// Run `action` if the signer is the `owner()` of `contract`.
pub async fn run_as_owner<C, T, A, AF>(
    client: &C,
    contract: Address,
    action: A,
) -> Result<AuthorityOutcome<T>>
where
    C: ChainClient,
    A: FnOnce() -> AF,
    AF: Future<Output = Result<T>>,
{
    let owner = read_owner(client, contract).await?;
    let signer = client.signer_address();

    if owner != signer {
        return Ok(not_authorized(contract, signer, owner));
    }

    Ok(AuthorityOutcome::Applied(action().await?))
}

fn not_authorized<T>(contract: Address, signer: Address, authority: Address) -> AuthorityOutcome<T> {
    tracing::warn!(
        contract = %contract,
        signer = %signer,
        authority = %authority,
        "Signer is not the authority, skipping"
    );
    AuthorityOutcome::NotAuthorized { signer, authority }
}
