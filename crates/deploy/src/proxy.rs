//! Transparent upgradeable proxy lifecycle: wrap, upgrade, change admin.

use alloy_core::primitives::{Address, Bytes};
use anyhow::{Context, Result};

use crate::authority::{self, AuthorityOutcome};
use crate::chain::{self, ChainClient};
use crate::context::DeployContext;
use crate::contracts::{
    ADMIN_SLOT, IMPLEMENTATION_SLOT, IProxyAdmin, ITransparentUpgradeableProxy, TRANSPARENT_PROXY,
};
use crate::ledger::{Slot, VerificationArtifact, proxy_constructor_args};
use crate::reconcile::Reconciled;

/// Implementation address stored in the EIP-1967 slot of `proxy`.
pub async fn implementation_of<C: ChainClient>(client: &C, proxy: Address) -> Result<Address> {
    let word = client
        .get_storage_at(proxy, IMPLEMENTATION_SLOT)
        .await
        .with_context(|| format!("Failed to read implementation slot of {proxy}"))?;
    Ok(Address::from_word(word))
}

/// Admin address stored in the EIP-1967 slot of `proxy`.
pub async fn admin_of<C: ChainClient>(client: &C, proxy: Address) -> Result<Address> {
    let word = client
        .get_storage_at(proxy, ADMIN_SLOT)
        .await
        .with_context(|| format!("Failed to read admin slot of {proxy}"))?;
    Ok(Address::from_word(word))
}

/// An address is a proxy when its implementation slot is populated.
pub async fn is_proxy<C: ChainClient>(client: &C, address: Address) -> Result<bool> {
    Ok(!implementation_of(client, address).await?.is_zero())
}

/// Deploy `name` behind a transparent proxy administered by `admin`.
///
/// Addresses recovered from the ledger that are already proxies are returned
/// untouched; a bare implementation left by an interrupted run gets wrapped.
/// Returns the proxy address, which speaks the implementation's interface.
pub async fn deploy_behind_proxy<C: ChainClient>(
    ctx: &mut DeployContext<'_, C>,
    slot: Slot,
    name: &str,
    constructor_args: Bytes,
    admin: Address,
    initializer: Option<Bytes>,
) -> Result<Address> {
    let implementation_slot = Slot::implementation(slot.clone());
    let address = ctx
        .deploy_contract(slot.clone(), name, constructor_args, initializer.clone())
        .await?;

    if is_proxy(ctx.client, address).await? {
        tracing::info!(
            chain = ctx.chain,
            slot = %slot,
            proxy = %address,
            "Contract is already proxied"
        );
        if ctx.lookup(&implementation_slot).is_none() {
            let implementation = implementation_of(ctx.client, address).await?;
            ctx.bind(implementation_slot, implementation);
        }
        return Ok(address);
    }

    let init_data = initializer.unwrap_or_default();
    let proxy_args = proxy_constructor_args(address, admin, init_data.clone());
    let proxy = chain::deploy_bytecode(ctx.client, ctx.artifacts, TRANSPARENT_PROXY, &proxy_args)
        .await
        .with_context(|| format!("Failed to deploy proxy for {slot}"))?;

    ctx.bind(implementation_slot, address);
    ctx.bind(slot, proxy);
    ctx.verification
        .push(VerificationArtifact::proxy(proxy, address, admin, init_data));

    Ok(proxy)
}

/// Point `proxy` at `implementation`, calling `initializer` through it.
///
/// A no-op when the proxy already uses `implementation`.
pub async fn upgrade_and_initialize<C: ChainClient>(
    client: &C,
    proxy: Address,
    implementation: Address,
    initializer: Option<Bytes>,
) -> Result<Reconciled> {
    let current = implementation_of(client, proxy).await?;
    if current == implementation {
        tracing::info!(proxy = %proxy, implementation = %implementation, "Proxy implementation up to date");
        return Ok(Reconciled::Unchanged);
    }

    let data = initializer.unwrap_or_default();
    let admin_data = data.clone();

    let outcome = authority::resolve_and_run(
        client,
        proxy,
        || async move {
            if data.is_empty() {
                let call = ITransparentUpgradeableProxy::upgradeToCall {
                    newImplementation: implementation,
                };
                chain::send(client, proxy, call).await
            } else {
                let call = ITransparentUpgradeableProxy::upgradeToAndCallCall {
                    newImplementation: implementation,
                    data,
                };
                chain::send(client, proxy, call).await
            }
        },
        |admin| async move {
            if admin_data.is_empty() {
                let call = IProxyAdmin::upgradeCall { proxy, implementation };
                chain::send(client, admin, call).await
            } else {
                let call = IProxyAdmin::upgradeAndCallCall {
                    proxy,
                    implementation,
                    data: admin_data,
                };
                chain::send(client, admin, call).await
            }
        },
    )
    .await?;

    match outcome {
        AuthorityOutcome::Applied(receipt) => {
            let actual = implementation_of(client, proxy).await?;
            if actual != implementation {
                anyhow::bail!(
                    "Upgrade of proxy {proxy} did not take effect: implementation is {actual}, expected {implementation}"
                );
            }
            tracing::info!(proxy = %proxy, from = %current, to = %implementation, "Proxy upgraded");
            Ok(Reconciled::Updated(receipt))
        }
        AuthorityOutcome::NotAuthorized { authority, .. } => Ok(Reconciled::NotAuthorized {
            current,
            desired: implementation,
            authority,
        }),
    }
}

/// Make `new_admin` the admin of `proxy`.
pub async fn change_admin<C: ChainClient>(
    client: &C,
    proxy: Address,
    new_admin: Address,
) -> Result<Reconciled> {
    let current = admin_of(client, proxy).await?;
    if current == new_admin {
        tracing::debug!(proxy = %proxy, admin = %new_admin, "Proxy admin up to date");
        return Ok(Reconciled::Unchanged);
    }

    let outcome = authority::resolve_and_run(
        client,
        proxy,
        || {
            let call = ITransparentUpgradeableProxy::changeAdminCall { newAdmin: new_admin };
            chain::send(client, proxy, call)
        },
        |admin| {
            let call = IProxyAdmin::changeProxyAdminCall {
                proxy,
                newAdmin: new_admin,
            };
            chain::send(client, admin, call)
        },
    )
    .await?;

    match outcome {
        AuthorityOutcome::Applied(receipt) => {
            let actual = admin_of(client, proxy).await?;
            if actual != new_admin {
                anyhow::bail!(
                    "Admin change of proxy {proxy} did not take effect: admin is {actual}, expected {new_admin}"
                );
            }
            tracing::info!(proxy = %proxy, from = %current, to = %new_admin, "Proxy admin changed");
            Ok(Reconciled::Updated(receipt))
        }
        AuthorityOutcome::NotAuthorized { authority, .. } => Ok(Reconciled::NotAuthorized {
            current,
            desired: new_admin,
            authority,
        }),
    }
}
