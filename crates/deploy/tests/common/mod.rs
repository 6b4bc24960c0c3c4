//! In-memory chain used by the integration tests.
//!
//! Contracts are identified by the artifact name at the start of their init
//! code (`<name> 0x00 <constructor args>`). The chain executes the calldata of
//! the interfaces in `mailstack_deploy::contracts`, models transparent proxies
//! through their EIP-1967 slots and counts every submitted transaction.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy_core::primitives::{Address, B256, Bytes, U256};
use alloy_sol_types::abi::TokenSeq;
use alloy_sol_types::{SolCall, SolType, SolValue, sol_data};

/// ABI shape of `(address[], uint8)` values.
type AddressesAndThreshold = (sol_data::Array<sol_data::Address>, sol_data::Uint<8>);
use anyhow::{Context, Result};
use mailstack_deploy::contracts::{
    ADMIN_SLOT, AGGREGATION_HOOK, AGGREGATION_ISM, DOMAIN_ROUTING_ISM, IAggregationIsm,
    IInterchainSecurityModule, IMPLEMENTATION_SLOT, IMailbox, IMultisigIsm, IOwnable, IProxyAdmin,
    IRoutingIsm, ITestRecipient, ITransparentUpgradeableProxy, MAILBOX, MERKLE_ROOT_MULTISIG_ISM,
    MERKLE_TREE_HOOK, MESSAGE_ID_MULTISIG_ISM, PROTOCOL_FEE_HOOK, PROXY_ADMIN, TEST_ISM,
    TEST_RECIPIENT, TIMELOCK_CONTROLLER, TRANSPARENT_PROXY, VALIDATOR_ANNOUNCE,
};
use mailstack_deploy::{
    ChainClient, ContractArtifacts, TransactionReceipt, TransactionRequest, TxOverrides,
    VerificationArtifact, VerificationSink,
};

pub const ALREADY_INITIALIZED: &str = "execution reverted: Initializable: contract is already initialized";
pub const NOT_OWNER: &str = "execution reverted: Ownable: caller is not the owner";

pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

/// Artifacts for every contract the deployer knows about.
pub fn artifacts() -> ContractArtifacts {
    [
        PROXY_ADMIN,
        TRANSPARENT_PROXY,
        TIMELOCK_CONTROLLER,
        MAILBOX,
        VALIDATOR_ANNOUNCE,
        TEST_RECIPIENT,
        MESSAGE_ID_MULTISIG_ISM,
        MERKLE_ROOT_MULTISIG_ISM,
        AGGREGATION_ISM,
        DOMAIN_ROUTING_ISM,
        TEST_ISM,
        MERKLE_TREE_HOOK,
        PROTOCOL_FEE_HOOK,
        AGGREGATION_HOOK,
    ]
    .into_iter()
    .map(|name| {
        let mut bytecode = name.as_bytes().to_vec();
        bytecode.push(0);
        (name, bytecode)
    })
    .collect()
}

#[derive(Debug, Clone, Default)]
struct Account {
    name: String,
    storage: HashMap<B256, B256>,
    owner: Address,
    initialized: bool,
    local_domain: u32,
    default_ism: Address,
    default_hook: Address,
    required_hook: Address,
    ism: Address,
    module_type: u8,
    /// Validators of a multisig module, submodules of an aggregation module.
    members: Vec<Address>,
    threshold: u8,
    routes: BTreeMap<u32, Address>,
}

#[derive(Debug, Clone, Default)]
struct MockState {
    accounts: HashMap<Address, Account>,
    next_address: u64,
    signer: Address,
    submitted: usize,
    fail_all: bool,
    freeze_setters: bool,
    front_run_initialize: bool,
    submit_delay: Option<Duration>,
}

/// A chain held in memory.
#[derive(Debug, Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

impl MockChain {
    pub fn new(signer: Address) -> Self {
        Self {
            state: Mutex::new(MockState {
                signer,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().expect("mock chain state poisoned")
    }

    pub fn set_signer(&self, signer: Address) {
        self.state().signer = signer;
    }

    /// Every RPC call fails, as if the endpoint were down.
    pub fn set_fail_all(&self, fail: bool) {
        self.state().fail_all = fail;
    }

    /// Module and hook setters succeed without changing anything.
    pub fn set_freeze_setters(&self, freeze: bool) {
        self.state().freeze_setters = freeze;
    }

    /// The next mailbox `initialize` is preceded by another deployer's.
    pub fn set_front_run_initialize(&self, front_run: bool) {
        self.state().front_run_initialize = front_run;
    }

    pub fn set_submit_delay(&self, delay: Option<Duration>) {
        self.state().submit_delay = delay;
    }

    /// Transactions submitted so far, reverted ones included.
    pub fn submitted(&self) -> usize {
        self.state().submitted
    }

    /// Name of the contract at `address`.
    pub fn name_at(&self, address: Address) -> Option<String> {
        self.state()
            .accounts
            .get(&address)
            .map(|account| account.name.clone())
    }

    /// Number of contracts deployed from artifact `name`.
    pub fn count_named(&self, name: &str) -> usize {
        self.state()
            .accounts
            .values()
            .filter(|account| account.name == name)
            .count()
    }

    /// Deploy `name` outside of the deployer, as the signer.
    pub fn deploy(&self, name: &str, constructor_args: &[u8]) -> Address {
        let mut state = self.state();
        let from = state.signer;
        let mut init_code = name.as_bytes().to_vec();
        init_code.push(0);
        init_code.extend_from_slice(constructor_args);
        state.create(from, &init_code).expect("mock deployment failed")
    }

    fn execute(&self, tx: TransactionRequest) -> Result<TransactionReceipt> {
        let mut state = self.state();
        if state.fail_all {
            anyhow::bail!("connection refused");
        }
        state.submitted += 1;
        let from = state.signer;

        if let Some(to) = tx.to {
            if state.front_run_initialize
                && tx.data.starts_with(&IMailbox::initializeCall::SELECTOR)
            {
                state.front_run_initialize = false;
                let account = state.account_mut(to)?;
                account.initialized = true;
                account.owner = from;
            }
        }

        let mut next = state.clone();
        let contract_address = match tx.to {
            Some(to) => {
                next.dispatch(from, to, &tx.data)?;
                None
            }
            None => Some(next.create(from, &tx.data)?),
        };

        let nonce = next.submitted as u64;
        *state = next;
        Ok(TransactionReceipt {
            transaction_hash: B256::from(U256::from(nonce)),
            block_number: Some(nonce),
            contract_address,
        })
    }

    fn read<T>(&self, f: impl FnOnce(&MockState) -> Result<T>) -> Result<T> {
        let state = self.state();
        if state.fail_all {
            anyhow::bail!("connection refused");
        }
        f(&state)
    }
}

impl ChainClient for MockChain {
    fn signer_address(&self) -> Address {
        self.state().signer
    }

    fn transaction_overrides(&self) -> TxOverrides {
        TxOverrides::default()
    }

    fn get_code(&self, address: Address) -> impl Future<Output = Result<Bytes>> + Send {
        let code = self.read(|state| {
            Ok(state
                .accounts
                .get(&address)
                .map(|account| Bytes::from(account.name.clone().into_bytes()))
                .unwrap_or_default())
        });
        std::future::ready(code)
    }

    fn get_storage_at(
        &self,
        address: Address,
        slot: B256,
    ) -> impl Future<Output = Result<B256>> + Send {
        let word = self.read(|state| {
            Ok(state
                .accounts
                .get(&address)
                .and_then(|account| account.storage.get(&slot).copied())
                .unwrap_or_default())
        });
        std::future::ready(word)
    }

    fn get_block_number(&self) -> impl Future<Output = Result<u64>> + Send {
        std::future::ready(self.read(|state| Ok(state.submitted as u64)))
    }

    fn call(&self, to: Address, data: Bytes) -> impl Future<Output = Result<Bytes>> + Send {
        let output = self.read(|state| {
            let mut scratch = state.clone();
            scratch.dispatch(state.signer, to, &data)
        });
        std::future::ready(output)
    }

    fn submit(
        &self,
        tx: TransactionRequest,
    ) -> impl Future<Output = Result<TransactionReceipt>> + Send {
        async move {
            let delay = self.state().submit_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.execute(tx)
        }
    }
}

fn ret<T: SolValue>(value: T) -> Result<Bytes>
where
    for<'a> <T::SolType as SolType>::Token<'a>: TokenSeq<'a>,
{
    Ok(value.abi_encode_params().into())
}

fn selector(data: &[u8]) -> Result<[u8; 4]> {
    let selector = data.get(..4).context("execution reverted: calldata without selector")?;
    Ok(selector.try_into()?)
}

impl MockState {
    fn account(&self, address: Address) -> Result<&Account> {
        self.accounts
            .get(&address)
            .with_context(|| format!("execution reverted: no contract at {address}"))
    }

    fn account_mut(&mut self, address: Address) -> Result<&mut Account> {
        self.accounts
            .get_mut(&address)
            .with_context(|| format!("execution reverted: no contract at {address}"))
    }

    /// The account whose code runs at `address`.
    fn code_account(&self, address: Address) -> Result<&Account> {
        let account = self.account(address)?;
        if account.name == TRANSPARENT_PROXY {
            return self.account(self.slot(address, IMPLEMENTATION_SLOT));
        }
        Ok(account)
    }

    fn slot(&self, address: Address, slot: B256) -> Address {
        self.accounts
            .get(&address)
            .and_then(|account| account.storage.get(&slot))
            .map(|word| Address::from_word(*word))
            .unwrap_or_default()
    }

    fn set_slot(&mut self, address: Address, slot: B256, value: Address) -> Result<()> {
        self.account_mut(address)?
            .storage
            .insert(slot, value.into_word());
        Ok(())
    }

    fn only_owner(&self, this: Address, from: Address) -> Result<()> {
        if self.account(this)?.owner != from {
            anyhow::bail!(NOT_OWNER);
        }
        Ok(())
    }

    fn create(&mut self, from: Address, init_code: &[u8]) -> Result<Address> {
        let split = init_code
            .iter()
            .position(|byte| *byte == 0)
            .context("init code without artifact name")?;
        let name = std::str::from_utf8(&init_code[..split])?.to_string();
        let args = &init_code[split + 1..];

        self.next_address += 1;
        let mut bytes = [0u8; 20];
        bytes[0] = 0xc0;
        bytes[12..].copy_from_slice(&self.next_address.to_be_bytes());
        let address = Address::from(bytes);

        let mut account = Account {
            name: name.clone(),
            ..Default::default()
        };
        let mut init_data = None;

        match name.as_str() {
            PROXY_ADMIN | TEST_RECIPIENT => account.owner = from,
            MAILBOX => account.local_domain = <(u32,)>::abi_decode_params(args, true)?.0,
            MESSAGE_ID_MULTISIG_ISM | MERKLE_ROOT_MULTISIG_ISM => {
                let (validators, threshold) = AddressesAndThreshold::abi_decode_params(args, true)?;
                account.module_type = if name == MESSAGE_ID_MULTISIG_ISM { 5 } else { 4 };
                account.members = validators;
                account.threshold = threshold;
            }
            AGGREGATION_ISM => {
                let (modules, threshold) = AddressesAndThreshold::abi_decode_params(args, true)?;
                account.module_type = 2;
                account.members = modules;
                account.threshold = threshold;
            }
            DOMAIN_ROUTING_ISM => account.module_type = 1,
            TEST_ISM => account.module_type = 6,
            TRANSPARENT_PROXY => {
                let (implementation, admin, data) =
                    <(Address, Address, Bytes)>::abi_decode_params(args, true)?;
                account
                    .storage
                    .insert(IMPLEMENTATION_SLOT, implementation.into_word());
                account.storage.insert(ADMIN_SLOT, admin.into_word());
                if !data.is_empty() {
                    init_data = Some((implementation, data));
                }
            }
            _ => {}
        }

        self.accounts.insert(address, account);
        if let Some((implementation, data)) = init_data {
            let logic = self.account(implementation)?.name.clone();
            self.run_logic(&logic, address, from, &data)?;
        }
        Ok(address)
    }

    fn dispatch(&mut self, from: Address, to: Address, data: &[u8]) -> Result<Bytes> {
        let Some(account) = self.accounts.get(&to) else {
            return Ok(Bytes::new());
        };

        if account.name != TRANSPARENT_PROXY {
            let logic = account.name.clone();
            return self.run_logic(&logic, to, from, data);
        }

        if from == self.slot(to, ADMIN_SLOT) {
            return self.proxy_admin_call(to, from, data);
        }
        let implementation = self.slot(to, IMPLEMENTATION_SLOT);
        let logic = self.account(implementation)?.name.clone();
        self.run_logic(&logic, to, from, data)
    }

    fn proxy_admin_call(&mut self, proxy: Address, from: Address, data: &[u8]) -> Result<Bytes> {
        let selector = selector(data)?;
        if selector == ITransparentUpgradeableProxy::upgradeToCall::SELECTOR {
            let call = ITransparentUpgradeableProxy::upgradeToCall::abi_decode(data, true)?;
            self.set_slot(proxy, IMPLEMENTATION_SLOT, call.newImplementation)?;
        } else if selector == ITransparentUpgradeableProxy::upgradeToAndCallCall::SELECTOR {
            let call = ITransparentUpgradeableProxy::upgradeToAndCallCall::abi_decode(data, true)?;
            self.set_slot(proxy, IMPLEMENTATION_SLOT, call.newImplementation)?;
            let logic = self.account(call.newImplementation)?.name.clone();
            self.run_logic(&logic, proxy, from, &call.data)?;
        } else if selector == ITransparentUpgradeableProxy::changeAdminCall::SELECTOR {
            let call = ITransparentUpgradeableProxy::changeAdminCall::abi_decode(data, true)?;
            self.set_slot(proxy, ADMIN_SLOT, call.newAdmin)?;
        } else {
            anyhow::bail!(
                "execution reverted: TransparentUpgradeableProxy: admin cannot fallback to proxy target"
            );
        }
        Ok(Bytes::new())
    }

    fn run_logic(&mut self, logic: &str, this: Address, from: Address, data: &[u8]) -> Result<Bytes> {
        let selector = selector(data)?;

        if selector == IOwnable::ownerCall::SELECTOR {
            return ret((self.account(this)?.owner,));
        }
        if selector == IOwnable::transferOwnershipCall::SELECTOR {
            let call = IOwnable::transferOwnershipCall::abi_decode(data, true)?;
            self.only_owner(this, from)?;
            self.account_mut(this)?.owner = call.newOwner;
            return Ok(Bytes::new());
        }

        match logic {
            PROXY_ADMIN => self.run_proxy_admin(this, from, selector, data),
            MAILBOX => self.run_mailbox(this, from, selector, data),
            TEST_RECIPIENT => self.run_recipient(this, from, selector, data),
            MESSAGE_ID_MULTISIG_ISM | MERKLE_ROOT_MULTISIG_ISM | AGGREGATION_ISM
            | DOMAIN_ROUTING_ISM | TEST_ISM => self.run_module(logic, this, selector, data),
            _ => anyhow::bail!("execution reverted: {logic} has no function {}", hex::encode(selector)),
        }
    }

    fn run_proxy_admin(
        &mut self,
        this: Address,
        from: Address,
        selector: [u8; 4],
        data: &[u8],
    ) -> Result<Bytes> {
        self.only_owner(this, from)?;

        let forwarded = if selector == IProxyAdmin::upgradeCall::SELECTOR {
            let call = IProxyAdmin::upgradeCall::abi_decode(data, true)?;
            let inner = ITransparentUpgradeableProxy::upgradeToCall {
                newImplementation: call.implementation,
            };
            (call.proxy, inner.abi_encode())
        } else if selector == IProxyAdmin::upgradeAndCallCall::SELECTOR {
            let call = IProxyAdmin::upgradeAndCallCall::abi_decode(data, true)?;
            let inner = ITransparentUpgradeableProxy::upgradeToAndCallCall {
                newImplementation: call.implementation,
                data: call.data,
            };
            (call.proxy, inner.abi_encode())
        } else if selector == IProxyAdmin::changeProxyAdminCall::SELECTOR {
            let call = IProxyAdmin::changeProxyAdminCall::abi_decode(data, true)?;
            let inner = ITransparentUpgradeableProxy::changeAdminCall {
                newAdmin: call.newAdmin,
            };
            (call.proxy, inner.abi_encode())
        } else {
            anyhow::bail!("execution reverted: unknown ProxyAdmin function");
        };

        let (proxy, inner) = forwarded;
        self.dispatch(this, proxy, &inner)
    }

    fn run_mailbox(
        &mut self,
        this: Address,
        from: Address,
        selector: [u8; 4],
        data: &[u8],
    ) -> Result<Bytes> {
        let freeze = self.freeze_setters;
        let account = self.account(this)?.clone();

        if selector == IMailbox::initializeCall::SELECTOR {
            let call = IMailbox::initializeCall::abi_decode(data, true)?;
            if account.initialized {
                anyhow::bail!(ALREADY_INITIALIZED);
            }
            let account = self.account_mut(this)?;
            account.initialized = true;
            account.owner = call._owner;
            account.default_ism = call._defaultIsm;
            account.default_hook = call._defaultHook;
            account.required_hook = call._requiredHook;
            return Ok(Bytes::new());
        }
        if selector == IMailbox::localDomainCall::SELECTOR {
            // Immutable: lives in the implementation's code.
            return ret((self.code_account(this)?.local_domain,));
        }
        if selector == IMailbox::defaultIsmCall::SELECTOR {
            return ret((account.default_ism,));
        }
        if selector == IMailbox::defaultHookCall::SELECTOR {
            return ret((account.default_hook,));
        }
        if selector == IMailbox::requiredHookCall::SELECTOR {
            return ret((account.required_hook,));
        }

        self.only_owner(this, from)?;
        if selector == IMailbox::setDefaultIsmCall::SELECTOR {
            let call = IMailbox::setDefaultIsmCall::abi_decode(data, true)?;
            if !freeze {
                self.account_mut(this)?.default_ism = call._module;
            }
        } else if selector == IMailbox::setDefaultHookCall::SELECTOR {
            let call = IMailbox::setDefaultHookCall::abi_decode(data, true)?;
            if !freeze {
                self.account_mut(this)?.default_hook = call._hook;
            }
        } else if selector == IMailbox::setRequiredHookCall::SELECTOR {
            let call = IMailbox::setRequiredHookCall::abi_decode(data, true)?;
            if !freeze {
                self.account_mut(this)?.required_hook = call._hook;
            }
        } else {
            anyhow::bail!("execution reverted: unknown Mailbox function");
        }
        Ok(Bytes::new())
    }

    fn run_recipient(
        &mut self,
        this: Address,
        from: Address,
        selector: [u8; 4],
        data: &[u8],
    ) -> Result<Bytes> {
        if selector == ITestRecipient::interchainSecurityModuleCall::SELECTOR {
            return ret((self.account(this)?.ism,));
        }
        if selector == ITestRecipient::setInterchainSecurityModuleCall::SELECTOR {
            let call = ITestRecipient::setInterchainSecurityModuleCall::abi_decode(data, true)?;
            self.only_owner(this, from)?;
            if !self.freeze_setters {
                self.account_mut(this)?.ism = call._ism;
            }
            return Ok(Bytes::new());
        }
        anyhow::bail!("execution reverted: unknown TestRecipient function")
    }

    fn run_module(
        &mut self,
        logic: &str,
        this: Address,
        selector: [u8; 4],
        data: &[u8],
    ) -> Result<Bytes> {
        let account = self.account(this)?.clone();

        if selector == IInterchainSecurityModule::moduleTypeCall::SELECTOR {
            return Ok(<(sol_data::Uint<8>,)>::abi_encode_params(&(account.module_type,)).into());
        }

        match logic {
            MESSAGE_ID_MULTISIG_ISM | MERKLE_ROOT_MULTISIG_ISM
                if selector == IMultisigIsm::validatorsAndThresholdCall::SELECTOR =>
            {
                Ok(AddressesAndThreshold::abi_encode_params(&(account.members, account.threshold)).into())
            }
            AGGREGATION_ISM if selector == IAggregationIsm::modulesAndThresholdCall::SELECTOR => {
                Ok(AddressesAndThreshold::abi_encode_params(&(account.members, account.threshold)).into())
            }
            DOMAIN_ROUTING_ISM if selector == IRoutingIsm::initializeCall::SELECTOR => {
                let call = IRoutingIsm::initializeCall::abi_decode(data, true)?;
                if account.initialized {
                    anyhow::bail!(ALREADY_INITIALIZED);
                }
                let account = self.account_mut(this)?;
                account.initialized = true;
                account.owner = call._owner;
                account.routes = call._domains.into_iter().zip(call._modules).collect();
                Ok(Bytes::new())
            }
            DOMAIN_ROUTING_ISM if selector == IRoutingIsm::domainsCall::SELECTOR => {
                let domains: Vec<U256> = account.routes.keys().map(|d| U256::from(*d)).collect();
                ret((domains,))
            }
            DOMAIN_ROUTING_ISM if selector == IRoutingIsm::moduleCall::SELECTOR => {
                let call = IRoutingIsm::moduleCall::abi_decode(data, true)?;
                let module = account
                    .routes
                    .get(&call.origin)
                    .context("execution reverted: No ISM found for origin")?;
                ret((*module,))
            }
            _ => anyhow::bail!("execution reverted: unknown {logic} function"),
        }
    }
}

/// Verification sink keeping everything it receives. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingVerifier {
    submitted: Arc<Mutex<Vec<(String, VerificationArtifact)>>>,
}

impl RecordingVerifier {
    pub fn submitted(&self) -> Vec<(String, VerificationArtifact)> {
        self.submitted.lock().expect("verifier poisoned").clone()
    }
}

impl VerificationSink for RecordingVerifier {
    fn submit(
        &self,
        chain: &str,
        artifact: &VerificationArtifact,
    ) -> impl Future<Output = Result<()>> + Send {
        self.submitted
            .lock()
            .expect("verifier poisoned")
            .push((chain.to_string(), artifact.clone()));
        std::future::ready(Ok(()))
    }
}

/// Verification sink that rejects everything.
#[derive(Debug, Default)]
pub struct FailingVerifier;

impl VerificationSink for FailingVerifier {
    fn submit(
        &self,
        _chain: &str,
        _artifact: &VerificationArtifact,
    ) -> impl Future<Output = Result<()>> + Send {
        std::future::ready(Err(anyhow::anyhow!("explorer unavailable")))
    }
}
