use std::sync::mpsc::{Receiver, Sender};
use std::sync::Weak;

use crate::engine::{AccountEvents, AccountId, CallEvents, CallId, EngineError};
use crate::settings::AccountConfig;

/// Requests from the API side of the engine to its SIP worker.
pub enum EngineCommand {
    AddAccount {
        config: AccountConfig,
        expires: u32,
        events: Weak<dyn AccountEvents>,
        reply: Sender<Result<AccountId, EngineError>>,
    },
    RemoveAccount(AccountId),
    MakeCall {
        account: AccountId,
        destination: String,
        events: Weak<dyn CallEvents>,
        reply: Sender<Result<CallId, EngineError>>,
    },
    Hangup(CallId),
    HangupAll,
    Shutdown,
}

pub type EngineCommandSender = Sender<EngineCommand>;
pub type EngineCommandReceiver = Receiver<EngineCommand>;
