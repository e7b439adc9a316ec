//! Name registry state machine
//!
//! Commit-reveal registration of vanity names with length-based pricing,
//! owner renewals, releases into a withdrawable balance, and forwarding
//! of value-bearing calls to a name's owner.

use crate::clock::{Clock, SystemClock};
use crate::commitment::verify_commitment;
use crate::config::RegistryConfig;
use crate::errors::*;
use crate::forwarding::{CallForwarder, NoopForwarder};
use crate::name::{is_valid_name, name_length, validate_name};
use crate::pricing::FeeSchedule;
use crate::types::*;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RegistryState {
    /// Account → outstanding commitment
    pending: HashMap<AccountId, PendingCommitment>,
    /// Canonical name → registration
    registrations: HashMap<Name, Registration>,
    /// Account → balances and name history
    ledgers: HashMap<AccountId, AccountLedger>,
    total_forwarded: Amount,
}

impl RegistryState {
    /// Move a removed registration's locked funds into its owner's withdrawable balance.
    fn settle_release(&mut self, registration: &Registration) {
        let ledger = self.ledgers.entry(registration.owner).or_default();
        ledger.total_locked = ledger
            .total_locked
            .saturating_sub(registration.amount_locked);
        ledger.free_balance = ledger
            .free_balance
            .saturating_add(registration.amount_locked);
    }
}

/// Vanity name registry
///
/// Every operation runs under a single lock and validates fully before mutating, so a
/// failed call leaves state unchanged. The only exception to holding the lock for the
/// whole call is [`NameRegistry::resolve_and_forward`], which releases it while the
/// forwarder runs.
pub struct NameRegistry {
    state: RwLock<RegistryState>,
    config: RegistryConfig,
    fees: FeeSchedule,
    clock: Arc<dyn Clock>,
    forwarder: Arc<dyn CallForwarder>,
}

impl NameRegistry {
    /// Create a registry after validating `config`.
    pub fn new(
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        forwarder: Arc<dyn CallForwarder>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            state: RwLock::new(RegistryState::default()),
            fees: FeeSchedule::from_config(&config),
            config,
            clock,
            forwarder,
        })
    }

    /// Wall-clock registry that accepts every forwarded call.
    pub fn with_system_clock(config: RegistryConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemClock), Arc::new(NoopForwarder))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn fee_schedule(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Commit phase. Overwrites any earlier commitment from the same account.
    pub fn begin_registration(
        &self,
        committer: &AccountId,
        commitment: Digest,
    ) -> Result<PendingCommitment> {
        if committer.is_unowned() {
            return Err(RegistryError::InvalidCaller);
        }

        let now = self.clock.now();
        let pending = PendingCommitment {
            commitment,
            earliest_reveal_time: now.saturating_add(self.config.required_delay),
        };

        let previous = self.state.write().pending.insert(*committer, pending);
        if previous.is_some() {
            debug!("Commitment from {} replaced an unrevealed one", committer);
        }
        debug!(
            "Commitment {} from {} revealable at {}",
            commitment.to_hex(),
            committer,
            pending.earliest_reveal_time
        );

        Ok(pending)
    }

    /// Reveal phase: charge, validate and record ownership of `name`.
    pub fn complete_registration(
        &self,
        committer: &AccountId,
        name: &Name,
        salt: &Salt,
        paid: Amount,
    ) -> Result<RegistrationReceipt> {
        let now = self.clock.now();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let pending = state
            .pending
            .get(committer)
            .copied()
            .filter(|p| !p.commitment.is_empty())
            .ok_or_else(|| RegistryError::NoPendingCommitment {
                account: committer.to_string(),
            })?;

        if now < pending.earliest_reveal_time {
            return Err(RegistryError::DelayNotElapsed {
                earliest: pending.earliest_reveal_time,
                now,
            });
        }

        let price = self.fees.price_of(name)?;
        if paid < price {
            return Err(RegistryError::InsufficientPayment {
                required: price,
                paid,
            });
        }

        if !verify_commitment(&pending.commitment, committer, name, salt) {
            return Err(RegistryError::CommitmentMismatch);
        }

        validate_name(name, &self.config)?;

        let key = name.canonical();
        if let Some(existing) = state.registrations.get(&key) {
            if !existing.is_expired(now) {
                return Err(RegistryError::NameAlreadyRegistered {
                    name: key.to_string(),
                });
            }
        }

        // All checks passed; mutate.
        if let Some(previous) = state.registrations.remove(&key) {
            info!(
                "Expired registration of {} by {} reclaimed by {}",
                key, previous.owner, committer
            );
            state.settle_release(&previous);
        }

        let registration = Registration {
            name: key,
            owner: *committer,
            expiration: now.saturating_add(self.config.registration_period),
            amount_locked: price,
        };
        state.registrations.insert(key, registration.clone());

        let ledger = state.ledgers.entry(*committer).or_default();
        ledger.total_locked = ledger.total_locked.saturating_add(price);
        if !ledger.owned_names.contains(&key) {
            ledger.owned_names.push(key);
        }

        state.pending.remove(committer);

        metrics::counter!("vanity_registrations_total").increment(1);
        info!(
            "Registered {} to {} until {} (locked {})",
            key, committer, registration.expiration, price
        );

        Ok(RegistrationReceipt {
            registration,
            refund: paid - price,
        })
    }

    /// Extend a registration by one renewal period while its renewal window is open.
    pub fn renew_registration(&self, caller: &AccountId, name: &Name) -> Result<Registration> {
        let now = self.clock.now();
        let key = name.canonical();
        let mut state = self.state.write();

        let registration = state.registrations.get_mut(&key).ok_or_else(|| {
            RegistryError::NameNotRegistered {
                name: key.to_string(),
            }
        })?;

        if registration.owner != *caller {
            return Err(RegistryError::NotOwner {
                name: key.to_string(),
                account: caller.to_string(),
            });
        }

        let opens_at = registration
            .expiration
            .saturating_sub(self.config.renewal_period);
        if now < opens_at || now >= registration.expiration {
            return Err(RegistryError::RenewalWindowClosed {
                name: key.to_string(),
                opens_at,
                expires_at: registration.expiration,
            });
        }

        registration.expiration = registration
            .expiration
            .saturating_add(self.config.renewal_period);

        metrics::counter!("vanity_renewals_total").increment(1);
        info!("Renewed {} until {}", key, registration.expiration);

        Ok(registration.clone())
    }

    /// Delete a registration. The owner may always release; anyone may release once expired.
    ///
    /// Locked funds go to the owner's withdrawable balance. The name stays in the owner's
    /// `owned_names` history.
    pub fn release_registration(&self, caller: &AccountId, name: &Name) -> Result<Registration> {
        let now = self.clock.now();
        let key = name.canonical();
        let mut guard = self.state.write();
        let state = &mut *guard;

        let registration = state.registrations.get(&key).ok_or_else(|| {
            RegistryError::NameNotRegistered {
                name: key.to_string(),
            }
        })?;
        if registration.owner != *caller && !registration.is_expired(now) {
            return Err(RegistryError::NotOwner {
                name: key.to_string(),
                account: caller.to_string(),
            });
        }

        let registration = state.registrations.remove(&key).ok_or_else(|| {
            RegistryError::NameNotRegistered {
                name: key.to_string(),
            }
        })?;
        state.settle_release(&registration);

        metrics::counter!("vanity_releases_total").increment(1);
        info!(
            "Released {} (owner {}, by {}), {} now withdrawable",
            key, registration.owner, caller, registration.amount_locked
        );

        Ok(registration)
    }

    /// Pay out and zero the account's withdrawable balance.
    pub fn withdraw(&self, account: &AccountId) -> Result<Amount> {
        let mut state = self.state.write();
        let amount = state
            .ledgers
            .get_mut(account)
            .map(|ledger| std::mem::take(&mut ledger.free_balance))
            .unwrap_or(0);

        if amount > 0 {
            info!("Withdrawal of {} by {}", amount, account);
        }
        Ok(amount)
    }

    /// Accept `nonce` for `account` if it is the next expected one, and advance the counter.
    ///
    /// Signed requests carry the nonce, so a captured request body cannot be replayed.
    pub fn consume_nonce(&self, account: &AccountId, nonce: u64) -> Result<u64> {
        if account.is_unowned() {
            return Err(RegistryError::InvalidCaller);
        }
        let mut state = self.state.write();
        let ledger = state.ledgers.entry(*account).or_default();
        if nonce != ledger.nonce {
            return Err(RegistryError::InvalidNonce {
                account: account.to_string(),
                expected: ledger.nonce,
                found: nonce,
            });
        }
        ledger.nonce = ledger.nonce.saturating_add(1);
        Ok(ledger.nonce)
    }

    /// Forward `value` and `payload` to the current owner of `name`.
    pub fn resolve_and_forward(
        &self,
        caller: &AccountId,
        name: &Name,
        value: Amount,
        payload: Vec<u8>,
        paid: Amount,
    ) -> Result<ForwardReceipt> {
        let now = self.clock.now();
        let key = name.canonical();

        let recipient = {
            let state = self.state.read();
            let registration = state.registrations.get(&key).ok_or_else(|| {
                RegistryError::NameNotRegistered {
                    name: key.to_string(),
                }
            })?;
            if registration.is_expired(now) {
                return Err(RegistryError::NameExpired {
                    name: key.to_string(),
                });
            }
            if paid != value {
                return Err(RegistryError::PaymentMismatch { value, paid });
            }
            registration.owner
        };

        let call = ForwardedCall {
            from: *caller,
            to: recipient,
            name: key,
            value,
            payload,
        };

        // No lock is held here: the callee may re-enter the registry.
        let output = self.forwarder.forward(&call).map_err(|err| {
            metrics::counter!("vanity_forward_failures_total").increment(1);
            warn!("Forward to {} via {} failed: {}", recipient, key, err);
            RegistryError::ForwardingFailed {
                name: key.to_string(),
                reason: err.to_string(),
            }
        })?;

        let mut state = self.state.write();
        let unchanged = state
            .registrations
            .get(&key)
            .is_some_and(|registration| registration.owner == recipient);
        if !unchanged {
            warn!("Owner of {} changed during a forwarded call", key);
            return Err(RegistryError::RecipientChanged {
                name: key.to_string(),
            });
        }
        state.total_forwarded = state.total_forwarded.saturating_add(value);

        metrics::counter!("vanity_forwards_total").increment(1);
        debug!("Forwarded {} from {} to {} via {}", value, caller, recipient, key);

        Ok(ForwardReceipt {
            name: key,
            recipient,
            value,
            output,
        })
    }

    pub fn price_of(&self, name: &Name) -> Result<Amount> {
        self.fees.price_of(name)
    }

    pub fn name_length(&self, name: &Name) -> usize {
        name_length(name)
    }

    pub fn is_valid_name(&self, name: &Name) -> bool {
        is_valid_name(name)
    }

    /// Resolve name → owner
    pub fn resolve(&self, name: &Name) -> Result<AccountId> {
        let key = name.canonical();
        let state = self.state.read();
        match state.registrations.get(&key) {
            Some(registration) if registration.is_expired(self.clock.now()) => {
                Err(RegistryError::NameExpired {
                    name: key.to_string(),
                })
            }
            Some(registration) => Ok(registration.owner),
            None => Err(RegistryError::NameNotRegistered {
                name: key.to_string(),
            }),
        }
    }

    /// Registration record for `name`, expired or not.
    pub fn registration(&self, name: &Name) -> Option<Registration> {
        self.state
            .read()
            .registrations
            .get(&name.canonical())
            .cloned()
    }

    pub fn pending_commitment(&self, account: &AccountId) -> Option<PendingCommitment> {
        self.state.read().pending.get(account).copied()
    }

    pub fn ledger(&self, account: &AccountId) -> AccountLedger {
        self.state
            .read()
            .ledgers
            .get(account)
            .cloned()
            .unwrap_or_default()
    }

    /// Every name ever attributed to `account`. May include released or expired names.
    pub fn owned_names(&self, account: &AccountId) -> Vec<Name> {
        self.state
            .read()
            .ledgers
            .get(account)
            .map(|ledger| ledger.owned_names.clone())
            .unwrap_or_default()
    }

    /// True if `account` currently holds an unexpired registration of `name`.
    pub fn owns(&self, account: &AccountId, name: &Name) -> bool {
        let now = self.clock.now();
        self.state
            .read()
            .registrations
            .get(&name.canonical())
            .is_some_and(|r| r.owner == *account && !r.is_expired(now))
    }

    /// Names `account` currently holds, in first-registration order.
    pub fn live_names(&self, account: &AccountId) -> Vec<Name> {
        let now = self.clock.now();
        let state = self.state.read();
        state
            .ledgers
            .get(account)
            .map(|ledger| {
                ledger
                    .owned_names
                    .iter()
                    .filter(|name| {
                        state
                            .registrations
                            .get(*name)
                            .is_some_and(|r| r.owner == *account && !r.is_expired(now))
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            registrations: state.registrations.len(),
            pending_commitments: state.pending.len(),
            total_locked: state.ledgers.values().map(|l| l.total_locked).sum(),
            total_withdrawable: state.ledgers.values().map(|l| l.free_balance).sum(),
            total_forwarded: state.total_forwarded,
        }
    }

    /// Copy of the full state, sorted for stable output.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();

        let mut pending: Vec<_> = state.pending.iter().map(|(a, p)| (*a, *p)).collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut registrations: Vec<_> = state.registrations.values().cloned().collect();
        registrations.sort_by(|a, b| a.name.cmp(&b.name));

        let mut ledgers: Vec<_> = state
            .ledgers
            .iter()
            .filter(|(_, l)| !l.is_empty())
            .map(|(a, l)| (*a, l.clone()))
            .collect();
        ledgers.sort_by(|a, b| a.0.cmp(&b.0));

        RegistrySnapshot {
            pending,
            registrations,
            ledgers,
            total_forwarded: state.total_forwarded,
        }
    }

    /// Replace the whole state with `snapshot` after checking it is internally consistent.
    ///
    /// On error the current state is left untouched.
    pub fn restore(&self, snapshot: RegistrySnapshot) -> Result<()> {
        let restored = self.rebuild(snapshot)?;
        info!(
            "Restored {} registrations and {} pending commitments",
            restored.registrations.len(),
            restored.pending.len()
        );
        *self.state.write() = restored;
        Ok(())
    }

    fn rebuild(&self, snapshot: RegistrySnapshot) -> Result<RegistryState> {
        use RegistryError::InvalidSnapshot;

        let mut pending = HashMap::with_capacity(snapshot.pending.len());
        for (committer, commitment) in snapshot.pending {
            if committer.is_unowned() {
                return Err(InvalidSnapshot(
                    "pending commitment from the unowned sentinel".into(),
                ));
            }
            if pending.insert(committer, commitment).is_some() {
                return Err(InvalidSnapshot(format!(
                    "duplicate pending commitment for {committer}"
                )));
            }
        }

        let mut registrations = HashMap::with_capacity(snapshot.registrations.len());
        let mut locked: HashMap<AccountId, Amount> = HashMap::new();
        for registration in snapshot.registrations {
            let key = registration.name.canonical();
            validate_name(&key, &self.config)
                .map_err(|err| InvalidSnapshot(format!("registration {key}: {err}")))?;
            if registration.owner.is_unowned() {
                return Err(InvalidSnapshot(format!("registration {key} has no owner")));
            }
            let held = locked.entry(registration.owner).or_default();
            *held = held.saturating_add(registration.amount_locked);

            let registration = Registration {
                name: key,
                ..registration
            };
            if registrations.insert(key, registration).is_some() {
                return Err(InvalidSnapshot(format!("duplicate registration of {key}")));
            }
        }

        let mut ledgers = HashMap::with_capacity(snapshot.ledgers.len());
        for (account, ledger) in snapshot.ledgers {
            let expected = locked.get(&account).copied().unwrap_or(0);
            if ledger.total_locked != expected {
                return Err(InvalidSnapshot(format!(
                    "ledger of {account} locks {} but its registrations lock {expected}",
                    ledger.total_locked
                )));
            }
            if ledgers.insert(account, ledger).is_some() {
                return Err(InvalidSnapshot(format!("duplicate ledger for {account}")));
            }
        }
        if let Some((owner, amount)) = locked
            .iter()
            .find(|(owner, amount)| **amount > 0 && !ledgers.contains_key(*owner))
        {
            return Err(InvalidSnapshot(format!(
                "registrations of {owner} lock {amount} but it has no ledger"
            )));
        }

        Ok(RegistryState {
            pending,
            registrations,
            ledgers,
            total_forwarded: snapshot.total_forwarded,
        })
    }
}

impl fmt::Debug for NameRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameRegistry")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::commitment::commitment_hash;
    use crate::forwarding::{ForwardError, InboxForwarder};
    use std::sync::{OnceLock, Weak};

    const START: u64 = 1_700_000_000;

    fn account(byte: u8) -> AccountId {
        AccountId::new([byte; 32])
    }

    fn name(value: &str) -> Name {
        Name::parse(value).unwrap()
    }

    fn setup() -> (NameRegistry, Arc<ManualClock>, InboxForwarder) {
        let clock = Arc::new(ManualClock::new(START));
        let forwarder = InboxForwarder::new();
        let registry = NameRegistry::new(
            RegistryConfig::default(),
            clock.clone(),
            Arc::new(forwarder.clone()),
        )
        .unwrap();
        (registry, clock, forwarder)
    }

    /// Commit, wait out the delay and reveal at exactly the price.
    fn register(
        registry: &NameRegistry,
        clock: &ManualClock,
        owner: AccountId,
        value: &str,
    ) -> Registration {
        let salt = Salt::new([7; 32]);
        let n = name(value);
        registry
            .begin_registration(&owner, commitment_hash(&owner, &n, &salt))
            .unwrap();
        clock.advance(registry.config().required_delay);
        let price = registry.price_of(&n).unwrap();
        registry
            .complete_registration(&owner, &n, &salt, price)
            .unwrap()
            .registration
    }

    #[test]
    fn test_commit_reveal_round_trip() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let registration = register(&registry, &clock, alice, "abc");

        let config = registry.config();
        assert_eq!(registration.owner, alice);
        assert_eq!(
            registration.expiration,
            START + config.required_delay + config.registration_period
        );
        assert_eq!(registration.amount_locked, config.max_fee);
        assert_eq!(registry.resolve(&name("abc")).unwrap(), alice);
        assert!(registry.pending_commitment(&alice).is_none());

        let ledger = registry.ledger(&alice);
        assert_eq!(ledger.total_locked, config.max_fee);
        assert_eq!(ledger.owned_names, vec![name("abc")]);
    }

    #[test]
    fn test_reveal_without_commitment_fails() {
        let (registry, _, _) = setup();
        let err = registry
            .complete_registration(&account(1), &name("abc"), &Salt::new([0; 32]), 1_000_000)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoPendingCommitment { .. }));
    }

    #[test]
    fn test_reveal_before_delay_fails_and_changes_nothing() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let salt = Salt::new([3; 32]);
        let n = name("abc");
        registry
            .begin_registration(&alice, commitment_hash(&alice, &n, &salt))
            .unwrap();
        clock.advance(registry.config().required_delay - 1);

        let before = registry.snapshot();
        let err = registry
            .complete_registration(&alice, &n, &salt, 1_000_000)
            .unwrap_err();
        assert!(matches!(err, RegistryError::DelayNotElapsed { .. }));
        assert_eq!(registry.snapshot(), before);

        clock.advance(1);
        assert!(registry
            .complete_registration(&alice, &n, &salt, 1_000_000)
            .is_ok());
    }

    #[test]
    fn test_payment_below_price_fails_and_excess_is_refunded() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let salt = Salt::new([3; 32]);
        let n = name("abcd");
        let price = registry.price_of(&n).unwrap();
        registry
            .begin_registration(&alice, commitment_hash(&alice, &n, &salt))
            .unwrap();
        clock.advance(registry.config().required_delay);

        let err = registry
            .complete_registration(&alice, &n, &salt, price - 1)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::InsufficientPayment {
                required: price,
                paid: price - 1
            }
        );

        let receipt = registry
            .complete_registration(&alice, &n, &salt, price + 250)
            .unwrap();
        assert_eq!(receipt.refund, 250);
        assert_eq!(receipt.registration.amount_locked, price);
    }

    #[test]
    fn test_wrong_salt_is_commitment_mismatch() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let n = name("abc");
        registry
            .begin_registration(&alice, commitment_hash(&alice, &n, &Salt::new([1; 32])))
            .unwrap();
        clock.advance(registry.config().required_delay);

        let err = registry
            .complete_registration(&alice, &n, &Salt::new([2; 32]), 1_000_000)
            .unwrap_err();
        assert_eq!(err, RegistryError::CommitmentMismatch);
        assert!(registry.pending_commitment(&alice).is_some());
    }

    #[test]
    fn test_commitment_is_bound_to_committer() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let mallory = account(9);
        let salt = Salt::new([1; 32]);
        let n = name("abc");
        let digest = commitment_hash(&alice, &n, &salt);

        // Mallory copies Alice's digest and her later reveal.
        registry.begin_registration(&mallory, digest).unwrap();
        clock.advance(registry.config().required_delay);
        let err = registry
            .complete_registration(&mallory, &n, &salt, 1_000_000)
            .unwrap_err();
        assert_eq!(err, RegistryError::CommitmentMismatch);
    }

    #[test]
    fn test_invalid_characters_rejected_after_commitment_check() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let salt = Salt::new([1; 32]);
        let n = name("Abc");
        registry
            .begin_registration(&alice, commitment_hash(&alice, &n, &salt))
            .unwrap();
        clock.advance(registry.config().required_delay);

        let before = registry.snapshot();
        let err = registry
            .complete_registration(&alice, &n, &salt, 1_000_000)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName { .. }));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_live_name_cannot_be_taken() {
        let (registry, clock, _) = setup();
        register(&registry, &clock, account(1), "abc");

        let bob = account(2);
        let salt = Salt::new([5; 32]);
        let n = name("abc");
        registry
            .begin_registration(&bob, commitment_hash(&bob, &n, &salt))
            .unwrap();
        clock.advance(registry.config().required_delay);

        let before = registry.snapshot();
        let err = registry
            .complete_registration(&bob, &n, &salt, 1_000_000)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameAlreadyRegistered { .. }));
        assert_eq!(registry.snapshot(), before);
    }

    #[test]
    fn test_expired_name_reclaimed_pays_previous_owner() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let bob = account(2);
        let first = register(&registry, &clock, alice, "xyz");

        clock.set(first.expiration);
        let second = register(&registry, &clock, bob, "xyz");
        assert_eq!(second.owner, bob);

        let alice_ledger = registry.ledger(&alice);
        assert_eq!(alice_ledger.total_locked, 0);
        assert_eq!(alice_ledger.free_balance, first.amount_locked);
        // History is kept, live membership is not.
        assert_eq!(alice_ledger.owned_names, vec![name("xyz")]);
        assert!(!registry.owns(&alice, &name("xyz")));
        assert!(registry.live_names(&alice).is_empty());

        let bob_ledger = registry.ledger(&bob);
        assert_eq!(bob_ledger.total_locked, second.amount_locked);
        assert_eq!(bob_ledger.free_balance, 0);
        assert_eq!(registry.live_names(&bob), vec![name("xyz")]);
    }

    #[test]
    fn test_failed_reclaim_leaves_previous_owner_untouched() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let bob = account(2);
        let first = register(&registry, &clock, alice, "xyz");

        let n = name("xyz");
        registry
            .begin_registration(&bob, commitment_hash(&bob, &n, &Salt::new([1; 32])))
            .unwrap();
        clock.set(first.expiration);

        // Every check before the commitment passes; the salt is wrong.
        let before = registry.snapshot();
        let err = registry
            .complete_registration(&bob, &n, &Salt::new([2; 32]), 1_000_000)
            .unwrap_err();
        assert_eq!(err, RegistryError::CommitmentMismatch);
        assert_eq!(registry.snapshot(), before);
        assert_eq!(registry.registration(&n).unwrap().owner, alice);
        assert_eq!(registry.ledger(&alice).total_locked, first.amount_locked);
        assert_eq!(registry.ledger(&alice).free_balance, 0);
        assert!(registry.owned_names(&bob).is_empty());
    }

    #[test]
    fn test_renewal_window_boundaries() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let registration = register(&registry, &clock, alice, "abc");
        let renewal = registry.config().renewal_period;
        let opens_at = registration.expiration - renewal;

        clock.set(opens_at - 1);
        let err = registry.renew_registration(&alice, &name("abc")).unwrap_err();
        assert!(matches!(err, RegistryError::RenewalWindowClosed { .. }));

        clock.set(opens_at);
        let renewed = registry.renew_registration(&alice, &name("abc")).unwrap();
        assert_eq!(renewed.expiration, registration.expiration + renewal);
    }

    #[test]
    fn test_renewal_requires_owner_and_unexpired_name() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let registration = register(&registry, &clock, alice, "abc");
        clock.set(registration.expiration - 10);

        let err = registry
            .renew_registration(&account(2), &name("abc"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotOwner { .. }));

        clock.set(registration.expiration);
        let err = registry.renew_registration(&alice, &name("abc")).unwrap_err();
        assert!(matches!(err, RegistryError::RenewalWindowClosed { .. }));

        let err = registry
            .renew_registration(&alice, &name("nothere"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameNotRegistered { .. }));
    }

    #[test]
    fn test_release_rules_and_withdrawal() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let bob = account(2);
        let registration = register(&registry, &clock, alice, "abc");

        let err = registry
            .release_registration(&bob, &name("abc"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotOwner { .. }));

        registry.release_registration(&alice, &name("abc")).unwrap();
        assert!(registry.registration(&name("abc")).is_none());
        assert_eq!(registry.ledger(&alice).free_balance, registration.amount_locked);
        assert_eq!(registry.ledger(&alice).total_locked, 0);
        assert_eq!(registry.owned_names(&alice), vec![name("abc")]);

        assert_eq!(registry.withdraw(&alice).unwrap(), registration.amount_locked);
        assert_eq!(registry.withdraw(&alice).unwrap(), 0);
        assert_eq!(registry.withdraw(&bob).unwrap(), 0);
    }

    #[test]
    fn test_anyone_may_release_at_expiration() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let registration = register(&registry, &clock, alice, "abc");

        clock.set(registration.expiration - 1);
        assert!(registry.release_registration(&account(3), &name("abc")).is_err());

        clock.set(registration.expiration);
        let released = registry
            .release_registration(&account(3), &name("abc"))
            .unwrap();
        assert_eq!(released.owner, alice);
        // Funds go to the owner, not the caller.
        assert_eq!(registry.ledger(&alice).free_balance, registration.amount_locked);
        assert_eq!(registry.ledger(&account(3)).free_balance, 0);
    }

    #[test]
    fn test_overwritten_commitment_is_discarded() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let salt = Salt::new([1; 32]);
        registry
            .begin_registration(&alice, commitment_hash(&alice, &name("first"), &salt))
            .unwrap();
        registry
            .begin_registration(&alice, commitment_hash(&alice, &name("second"), &salt))
            .unwrap();
        clock.advance(registry.config().required_delay);

        let err = registry
            .complete_registration(&alice, &name("first"), &salt, 1_000_000)
            .unwrap_err();
        assert_eq!(err, RegistryError::CommitmentMismatch);
        assert!(registry
            .complete_registration(&alice, &name("second"), &salt, 1_000_000)
            .is_ok());
    }

    #[test]
    fn test_unowned_sentinel_cannot_commit() {
        let (registry, _, _) = setup();
        let err = registry
            .begin_registration(&AccountId::UNOWNED, Digest::new([1; 32]))
            .unwrap_err();
        assert_eq!(err, RegistryError::InvalidCaller);
    }

    #[test]
    fn test_forward_delivers_to_owner() {
        let (registry, clock, forwarder) = setup();
        let alice = account(1);
        let bob = account(2);
        register(&registry, &clock, alice, "abc");

        let receipt = registry
            .resolve_and_forward(&bob, &name("abc"), 42, b"hello".to_vec(), 42)
            .unwrap();
        assert_eq!(receipt.recipient, alice);
        assert_eq!(receipt.value, 42);

        let inbox = forwarder.inbox(&alice);
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].from, bob);
        assert_eq!(inbox[0].payload, b"hello".to_vec());
        assert_eq!(registry.stats().total_forwarded, 42);
    }

    #[test]
    fn test_forward_precondition_failures() {
        let (registry, clock, forwarder) = setup();
        let alice = account(1);
        let registration = register(&registry, &clock, alice, "abc");

        let err = registry
            .resolve_and_forward(&alice, &name("abc"), 10, vec![], 9)
            .unwrap_err();
        assert_eq!(err, RegistryError::PaymentMismatch { value: 10, paid: 9 });

        let err = registry
            .resolve_and_forward(&alice, &name("nobody"), 1, vec![], 1)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameNotRegistered { .. }));

        clock.set(registration.expiration);
        let err = registry
            .resolve_and_forward(&alice, &name("abc"), 1, vec![], 1)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NameExpired { .. }));
        assert!(forwarder.inbox(&alice).is_empty());
    }

    #[test]
    fn test_forward_failure_propagates() {
        let (registry, clock, forwarder) = setup();
        let alice = account(1);
        register(&registry, &clock, alice, "abc");
        forwarder.reject(alice);

        let err = registry
            .resolve_and_forward(&account(2), &name("abc"), 5, vec![], 5)
            .unwrap_err();
        assert!(matches!(err, RegistryError::ForwardingFailed { .. }));
        assert_eq!(registry.stats().total_forwarded, 0);
    }

    /// Callee that releases the name it was reached through.
    struct ReleasingForwarder {
        registry: OnceLock<Weak<NameRegistry>>,
    }

    impl CallForwarder for ReleasingForwarder {
        fn forward(&self, call: &ForwardedCall) -> std::result::Result<Vec<u8>, ForwardError> {
            let registry = self
                .registry
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| ForwardError::Backend("registry dropped".into()))?;
            registry
                .release_registration(&call.to, &call.name)
                .map_err(|e| ForwardError::Backend(e.to_string()))?;
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_reentrant_callee_is_detected() {
        let clock = Arc::new(ManualClock::new(START));
        let forwarder = Arc::new(ReleasingForwarder {
            registry: OnceLock::new(),
        });
        let registry = Arc::new(
            NameRegistry::new(RegistryConfig::default(), clock.clone(), forwarder.clone())
                .unwrap(),
        );
        let _ = forwarder.registry.set(Arc::downgrade(&registry));

        let alice = account(1);
        register(&registry, &clock, alice, "abc");

        let err = registry
            .resolve_and_forward(&account(2), &name("abc"), 5, vec![], 5)
            .unwrap_err();
        assert!(matches!(err, RegistryError::RecipientChanged { .. }));
        // The callee's own release went through without deadlocking.
        assert!(registry.registration(&name("abc")).is_none());
        assert_eq!(registry.stats().total_forwarded, 0);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (registry, clock, _) = setup();
        register(&registry, &clock, account(1), "abc");
        register(&registry, &clock, account(2), "defgh");
        registry
            .begin_registration(&account(3), Digest::new([8; 32]))
            .unwrap();

        let snapshot = registry.snapshot();
        let (restored, _, _) = setup();
        restored.restore(snapshot.clone()).unwrap();

        assert_eq!(restored.snapshot(), snapshot);
        assert_eq!(restored.resolve(&name("defgh")).unwrap(), account(2));
        assert_eq!(restored.stats().registrations, 2);
        assert_eq!(restored.stats().pending_commitments, 1);
    }

    #[test]
    fn test_restore_rejects_inconsistent_snapshots() {
        let (registry, clock, _) = setup();
        register(&registry, &clock, account(1), "abc");
        let good = registry.snapshot();

        let (target, _, _) = setup();
        target.restore(good.clone()).unwrap();

        let mut bad_name = good.clone();
        let mut raw = [0u8; 32];
        raw[..3].copy_from_slice(b"AB!");
        bad_name.registrations[0].name = Name::from_bytes(raw);
        bad_name.registrations[0].owner = AccountId::UNOWNED;

        let mut duplicate = good.clone();
        let mut second = duplicate.registrations[0].clone();
        second.name = name("dup");
        duplicate.registrations[0].name = name("dup");
        duplicate.registrations.push(second);

        let mut unowned = good.clone();
        unowned.registrations[0].owner = AccountId::UNOWNED;

        let mut unbalanced = good.clone();
        unbalanced.ledgers[0].1.total_locked += 1;

        let mut orphaned = good.clone();
        orphaned.ledgers.clear();

        let mut sentinel_commit = good.clone();
        sentinel_commit.pending.push((
            AccountId::UNOWNED,
            PendingCommitment {
                commitment: Digest::new([1; 32]),
                earliest_reveal_time: START,
            },
        ));

        let broken = [
            bad_name,
            duplicate,
            unowned,
            unbalanced,
            orphaned,
            sentinel_commit,
        ];
        for snapshot in broken {
            let err = target.restore(snapshot).unwrap_err();
            assert!(matches!(err, RegistryError::InvalidSnapshot(_)), "{err}");
            assert_eq!(target.snapshot(), good);
        }
    }

    #[test]
    fn test_nonce_is_single_use() {
        let (registry, _, _) = setup();
        let alice = account(1);

        assert_eq!(registry.consume_nonce(&alice, 0).unwrap(), 1);
        let err = registry.consume_nonce(&alice, 0).unwrap_err();
        assert_eq!(
            err,
            RegistryError::InvalidNonce {
                account: alice.to_string(),
                expected: 1,
                found: 0
            }
        );
        assert!(registry.consume_nonce(&alice, 5).is_err());
        assert_eq!(registry.consume_nonce(&alice, 1).unwrap(), 2);
        assert_eq!(registry.ledger(&alice).nonce, 2);
        assert_eq!(
            registry.consume_nonce(&AccountId::UNOWNED, 0).unwrap_err(),
            RegistryError::InvalidCaller
        );
    }

    #[test]
    fn test_nonce_survives_snapshot_and_empty_ledgers_are_skipped() {
        let (registry, clock, _) = setup();
        let alice = account(1);
        let bob = account(2);
        registry.consume_nonce(&alice, 0).unwrap();
        register(&registry, &clock, bob, "abc");
        registry.release_registration(&bob, &name("abc")).unwrap();
        registry.withdraw(&bob).unwrap();
        // Withdrawing from an account that never had a ledger creates nothing.
        registry.withdraw(&account(3)).unwrap();

        let snapshot = registry.snapshot();
        let accounts: Vec<_> = snapshot.ledgers.iter().map(|(a, _)| *a).collect();
        assert_eq!(accounts, vec![alice, bob]);

        let (restored, _, _) = setup();
        restored.restore(snapshot).unwrap();
        assert!(restored.consume_nonce(&alice, 0).is_err());
        assert!(restored.consume_nonce(&alice, 1).is_ok());
    }
}
