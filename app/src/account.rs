use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::engine::{AccountEvents, AccountId, EngineError, Endpoint};
use crate::settings::AccountConfig;
use crate::sync::Rendezvous;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Unregistered,
    Registering,
    Registered,
    Failed(u16),
}

impl RegistrationStatus {
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Registered)
    }
}

#[derive(Debug)]
struct AccountState {
    status: RegistrationStatus,
    /// Outcome of the first registration notification.
    first: Option<RegistrationStatus>,
}

/// Registration identity. Registration runs in the engine; this only tracks
/// the reported outcome and lets the driver block on the first one.
pub struct Account {
    endpoint: Arc<dyn Endpoint>,
    id: OnceLock<AccountId>,
    state: Mutex<AccountState>,
    gate: Rendezvous,
}

impl Account {
    pub fn create(endpoint: Arc<dyn Endpoint>, config: &AccountConfig) -> Result<Arc<Self>, EngineError> {
        let account = Arc::new(Self {
            endpoint,
            id: OnceLock::new(),
            state: Mutex::new(AccountState {
                status: RegistrationStatus::Registering,
                first: None,
            }),
            gate: Rendezvous::default(),
        });

        let weak: Weak<Account> = Arc::downgrade(&account);
        let events: Weak<dyn AccountEvents> = weak;
        let id = account.endpoint.add_account(config, events)?;
        let _ = account.id.set(id);
        log::debug!("account {} created for {}", id.0, config.id_uri);
        Ok(account)
    }

    fn lock(&self) -> MutexGuard<'_, AccountState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> Option<AccountId> {
        self.id.get().copied()
    }

    pub fn status(&self) -> RegistrationStatus {
        self.lock().status
    }

    /// Block until the registrar has answered once, whatever the answer.
    pub fn wait_for_first_registration_outcome(&self) -> RegistrationStatus {
        loop {
            if let Some(first) = self.lock().first {
                return first;
            }
            self.gate.wait();
        }
    }

    /// Bounded [`wait_for_first_registration_outcome`](Self::wait_for_first_registration_outcome).
    pub fn wait_for_first_registration_outcome_within(&self, timeout: Duration) -> Option<RegistrationStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(first) = self.lock().first {
                return Some(first);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !self.gate.wait_timeout(left) {
                return self.lock().first;
            }
        }
    }
}

impl AccountEvents for Account {
    fn on_reg_state(&self, code: u16, reason: &str, active: bool) {
        if active {
            log::info!("*** Register: code={code}");
        } else {
            log::info!("*** Unregister: code={code}");
        }
        if !reason.is_empty() {
            log::debug!("registration reason: {reason}");
        }

        let status = match code {
            200..=299 if active => RegistrationStatus::Registered,
            200..=299 => RegistrationStatus::Unregistered,
            _ => RegistrationStatus::Failed(code),
        };

        let first = {
            let mut st = self.lock();
            st.status = status;
            if st.first.is_none() {
                st.first = Some(status);
                true
            } else {
                false
            }
        };
        if first {
            self.gate.signal();
        }
    }
}

impl Drop for Account {
    fn drop(&mut self) {
        if let Some(id) = self.id.get() {
            self.endpoint.remove_account(*id);
        }
    }
}
