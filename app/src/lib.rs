//! One-shot SIP caller: register, place one call, play a WAV message into it
//! once media is up, hang up and exit.

use std::sync::Arc;
use std::thread;

use thiserror::Error;

use crate::account::{Account, RegistrationStatus};
use crate::call::Call;
use crate::engine::{CallOptions, EngineError, Endpoint, SipEngine};
use crate::player::{Player, PlayerError};
use crate::settings::{RegistrationPolicy, Settings};

pub mod account;
pub mod call;
pub mod cli;
pub mod engine;
pub mod messages;
pub mod player;
pub mod settings;
pub mod sync;
pub mod tasks;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("sound file: {0}")]
    Playback(#[from] PlayerError),
    #[error("cannot create SIP transport: {0}")]
    Transport(#[source] EngineError),
    #[error("engine error: {0}")]
    Engine(#[source] EngineError),
    #[error("registration was not accepted ({0:?})")]
    RegistrationRejected(RegistrationStatus),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Open the sound file, then bring up the SIP engine and place the call.
pub fn run(settings: &Settings) -> Result<(), AppError> {
    // No transport or account is created for a clip we cannot play.
    let player = Player::create(&settings.sound)?;
    log::info!("Announcement: {}", player.path().display());
    let engine = Arc::new(SipEngine::new(settings.engine.clone()));
    drive(engine, player, settings)
}

/// The call sequence against any [`Endpoint`].
pub fn drive(endpoint: Arc<dyn Endpoint>, player: Player, settings: &Settings) -> Result<(), AppError> {
    endpoint
        .create_transport(settings.engine.local_port)
        .map_err(AppError::Transport)?;
    endpoint.start().map_err(AppError::Engine)?;

    let result = place_call(&endpoint, player, settings);
    endpoint.shutdown();
    result
}

fn place_call(endpoint: &Arc<dyn Endpoint>, player: Player, settings: &Settings) -> Result<(), AppError> {
    let account = Account::create(endpoint.clone(), &settings.account).map_err(AppError::Engine)?;
    let registration = match settings.wait_timeout {
        Some(limit) => account
            .wait_for_first_registration_outcome_within(limit)
            .ok_or(AppError::Timeout("registration"))?,
        None => account.wait_for_first_registration_outcome(),
    };
    if !registration.is_registered() {
        if settings.registration == RegistrationPolicy::Require {
            return Err(AppError::RegistrationRejected(registration));
        }
        log::warn!("registration not accepted ({registration:?}), calling anyway");
    }

    let call = Call::make_call(
        endpoint.clone(),
        &account,
        &settings.destination,
        CallOptions::default(),
        Some(player),
    )
    .map_err(AppError::Engine)?;

    let woke = match settings.wait_timeout {
        Some(limit) => call.wait_within(limit),
        None => Some(call.wait()),
    };
    let (remote, state, code) = call.describe();
    match woke {
        Some(reason) => log::debug!("call wait ended: {reason:?}, {remote} [ {state} ] last status {code}"),
        None => log::warn!("gave up waiting for the call to {remote} [ {state} ]"),
    }

    endpoint.hangup_all();
    if !settings.hangup_grace.is_zero() {
        thread::sleep(settings.hangup_grace);
    }

    // The call goes before the account it was placed from.
    drop(call);
    drop(account);

    woke.map(|_| ()).ok_or(AppError::Timeout("the call"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{CallStep, MockEndpoint, MockSink};
    use crate::engine::{CallId, InviteState};
    use crate::player::tests::write_wav;
    use crate::settings::{AccountConfig, EngineConfig};
    use std::path::Path;
    use std::time::Duration;

    fn settings(sound: &Path) -> Settings {
        Settings {
            sound: sound.to_path_buf(),
            destination: "sip:103@sipserver".into(),
            account: AccountConfig {
                id_uri: "sip:120@sipserver".into(),
                registrar_uri: "sip:sipserver".into(),
                proxy: Some("sip:sipserver".into()),
                realm: "*".into(),
                user: "120".into(),
                password: "test".into(),
            },
            engine: EngineConfig::default(),
            log_level: 0,
            wait_timeout: Some(Duration::from_secs(5)),
            registration: RegistrationPolicy::Proceed,
            hangup_grace: Duration::ZERO,
        }
    }

    fn answered() -> Vec<CallStep> {
        vec![
            CallStep::State(InviteState::Calling, 0),
            CallStep::State(InviteState::Early, 180),
            CallStep::State(InviteState::Connecting, 200),
            CallStep::State(InviteState::Confirmed, 200),
            CallStep::Media,
        ]
    }

    fn position(commands: &[String], prefix: &str) -> usize {
        commands
            .iter()
            .position(|c| c.starts_with(prefix))
            .unwrap_or_else(|| panic!("no {prefix:?} in {commands:?}"))
    }

    #[test]
    fn registered_call_plays_then_hangs_up() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "msg.wav", 8000, 1, 800);
        let settings = settings(&sound);
        let endpoint = Arc::new(MockEndpoint::new(Some((200, true)), answered()));

        drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings).unwrap();

        assert_eq!(endpoint.sink().samples(), 800);
        let commands = endpoint.commands();
        assert_eq!(commands[0], "create_transport 0");
        assert_eq!(commands[1], "start");
        let order = [
            position(&commands, "add_account"),
            position(&commands, "make_call 1 sip:103@sipserver"),
            position(&commands, "hangup_all"),
            position(&commands, "remove_account 1"),
            position(&commands, "shutdown"),
        ];
        assert!(order.windows(2).all(|w| w[0] < w[1]), "{commands:?}");
    }

    #[test]
    fn rejected_registration_still_places_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "msg.wav", 8000, 1, 160);
        let endpoint = Arc::new(MockEndpoint::new(Some((403, true)), answered()));

        drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings(&sound)).unwrap();

        assert!(endpoint.commands().iter().any(|c| c.starts_with("make_call")));
        assert_eq!(endpoint.sink().samples(), 160);
    }

    #[test]
    fn required_registration_aborts_before_calling() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "msg.wav", 8000, 1, 160);
        let mut settings = settings(&sound);
        settings.registration = RegistrationPolicy::Require;
        let endpoint = Arc::new(MockEndpoint::new(Some((403, true)), answered()));

        let err = drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings).unwrap_err();

        assert!(matches!(
            err,
            AppError::RegistrationRejected(RegistrationStatus::Failed(403))
        ));
        let commands = endpoint.commands();
        assert!(!commands.iter().any(|c| c.starts_with("make_call")));
        assert_eq!(commands.last().map(String::as_str), Some("shutdown"));
    }

    #[test]
    fn missing_sound_file_fails_before_any_network_activity() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(&dir.path().join("missing.wav"));
        assert!(matches!(
            run(&settings),
            Err(AppError::Playback(PlayerError::Open { .. }))
        ));
    }

    #[test]
    fn transport_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "msg.wav", 8000, 1, 160);
        let endpoint = Arc::new(MockEndpoint::new(Some((200, true)), answered()).failing_transport());

        let err = drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings(&sound)).unwrap_err();

        assert!(matches!(err, AppError::Transport(_)));
        assert_eq!(endpoint.commands(), vec!["create_transport 0".to_string()]);
    }

    #[test]
    fn peer_hangup_during_playback_ends_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "long.wav", 8000, 1, 8000);
        let mut steps = answered();
        steps.push(CallStep::Pause(Duration::from_millis(50)));
        steps.push(CallStep::State(InviteState::Disconnected, 200));
        let endpoint = Arc::new(MockEndpoint::new(Some((200, true)), steps).with_sink(MockSink::holding()));

        drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings(&sound)).unwrap();

        // Already disconnected: hangup_all finds nothing to hang up.
        let commands = endpoint.commands();
        assert!(commands.iter().any(|c| c == "hangup_all"));
        assert!(!commands.iter().any(|c| c.starts_with("hangup ")), "{commands:?}");
    }

    #[test]
    fn redirect_is_followed() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "msg.wav", 8000, 1, 320);
        let steps = vec![
            CallStep::State(InviteState::Calling, 0),
            CallStep::Redirect("sip:104@sipserver".into()),
            CallStep::State(InviteState::Calling, 0),
            CallStep::State(InviteState::Confirmed, 200),
            CallStep::Media,
        ];
        let endpoint = Arc::new(MockEndpoint::new(Some((200, true)), steps));

        drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings(&sound)).unwrap();

        assert_eq!(endpoint.sink().samples(), 320);
        let info = endpoint.call_info(CallId(2)).unwrap();
        assert_eq!(info.remote_uri, "sip:104@sipserver");
    }

    #[test]
    fn silent_registrar_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let sound = write_wav(&dir, "msg.wav", 8000, 1, 160);
        let mut settings = settings(&sound);
        settings.wait_timeout = Some(Duration::from_millis(50));
        let endpoint = Arc::new(MockEndpoint::new(None, answered()));

        let err = drive(endpoint.clone(), Player::create(&sound).unwrap(), &settings).unwrap_err();

        assert!(matches!(err, AppError::Timeout("registration")));
        let commands = endpoint.commands();
        assert!(!commands.iter().any(|c| c.starts_with("make_call")));
        assert!(commands.iter().any(|c| c == "remove_account 1"));
    }
}
