use modemgate::error::GatewayError;
use modemgate::modem::{Modem, ModemState};
use modemgate::shutdown::ShutdownFlag;
use std::thread;
use std::time::{Duration, Instant};

mod common;
use common::{fast_timings, scripted_modem, ScriptedLine};

#[test]
fn init_sequence_is_sent_in_order_with_carriage_returns() {
    let (mut modem, mut caller, _) = scripted_modem();
    let init: Vec<String> = ["ATZ", "AT&D0", "AT&C0", "ATV1", "ATS0=1"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    modem.initialize(&init);

    assert_eq!(modem.state(), ModemState::WaitingForCall);
    let shown = caller.drain(Duration::from_millis(50));
    assert_eq!(shown, "ATZ\rAT&D0\rAT&C0\rATV1\rATS0=1\r");
}

#[test]
fn connect_banner_is_detected_and_returned() {
    let (mut modem, mut caller, _) = scripted_modem();
    caller.send(b"\r\nRING\r\n");
    caller.send(b"\r\nCONNECT 2400/ARQ\r\n");

    let banner = modem.wait_for_connect().unwrap();

    assert_eq!(banner, "CONNECT 2400/ARQ");
    assert_eq!(modem.state(), ModemState::Connected);
}

#[test]
fn connect_wait_observes_shutdown() {
    let (mut modem, _caller, _) = scripted_modem();
    let flag = modem.shutdown().clone();
    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        flag.trigger();
    });
    let err = modem.wait_for_connect().unwrap_err();
    trigger.join().unwrap();
    assert!(matches!(err, GatewayError::Cancelled));
}

#[test]
fn hangup_drops_dtr_then_escapes_and_sends_ath() {
    let (mut modem, mut caller, signals) = scripted_modem();

    modem.force_hangup();

    assert_eq!(signals.dtr_changes(), vec![false, true]);
    assert_eq!(caller.drain(Duration::from_millis(50)), "+++ATH\r");
    assert_eq!(modem.hangup_count(), 1);
}

#[test]
fn hangup_returns_as_soon_as_modem_answers() {
    let (line, mut caller, _) = ScriptedLine::pair();
    let mut timings = fast_timings();
    timings.hangup_timeout = Duration::from_secs(3);
    let mut modem = Modem::new(line, timings, ShutdownFlag::new());

    let answer = thread::spawn(move || {
        assert!(caller.expect("ATH\r", Duration::from_secs(2)));
        caller.send(b"\r\nNO CARRIER\r\n");
        caller
    });
    let start = Instant::now();
    modem.force_hangup();
    answer.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn unbounded_hangup_timeout_still_completes() {
    let (line, mut caller, _) = ScriptedLine::pair();
    let mut timings = fast_timings();
    timings.hangup_timeout = Duration::MAX;
    let mut modem = Modem::new(line, timings, ShutdownFlag::new());

    let answer = thread::spawn(move || {
        assert!(caller.expect("ATH\r", Duration::from_secs(2)));
        caller.send(b"\r\nOK\r\n");
    });
    modem.force_hangup();
    answer.join().unwrap();
    assert_eq!(modem.hangup_count(), 1);
}

#[test]
fn hangup_is_safe_on_a_dead_line_and_repeatable() {
    let (mut modem, caller, _) = scripted_modem();
    drop(caller);
    modem.force_hangup();
    modem.force_hangup();
    assert_eq!(modem.hangup_count(), 2);
}

#[test]
fn input_line_echoes_and_handles_backspace() {
    let (mut modem, mut caller, _) = scripted_modem();
    caller.send(b"ab\x08c\r");

    let typed = modem.input_line("Name: ", None, false).unwrap();

    assert_eq!(typed, "ac");
    assert_eq!(
        caller.drain(Duration::from_millis(50)),
        "Name: ab\x08 \x08c\r\n"
    );
}

#[test]
fn input_line_masks_passwords() {
    let (mut modem, mut caller, _) = scripted_modem();
    caller.send(b"pw\r");
    let typed = modem.input_line("Password: ", Some('*'), true).unwrap();
    assert_eq!(typed, "pw");
    assert_eq!(caller.drain(Duration::from_millis(50)), "Password: **\r\n");
}

#[test]
fn input_line_skips_blank_lines_unless_allowed() {
    let (mut modem, mut caller, _) = scripted_modem();
    caller.send(b"\r\nx\r");
    assert_eq!(modem.input_line("", None, false).unwrap(), "x");

    caller.send(b"\r");
    assert_eq!(modem.input_line("", None, true).unwrap(), "");
}

#[test]
fn getch_returns_the_next_key_and_print_line_ends_with_crlf() {
    let (mut modem, mut caller, _) = scripted_modem();
    caller.send(b"7");
    assert_eq!(modem.getch("Pick: ").unwrap(), b'7');
    modem.print_line("done").unwrap();
    assert_eq!(caller.drain(Duration::from_millis(50)), "Pick: done\r\n");
}

#[test]
fn pending_input_is_flushed() {
    let (mut modem, mut caller, _) = scripted_modem();
    caller.send(b"garbage");
    thread::sleep(Duration::from_millis(20));
    modem.flush_input();
    caller.send(b"5");
    assert_eq!(modem.getch("").unwrap(), b'5');
}
