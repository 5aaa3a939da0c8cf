//! UI sequencer: persistent tapes, flash overlays and the output rules.

use reader_kit::tasks::ui::{Led, UiCommand, UiEngine, UiFlash, UiPersistent};

fn led(engine: &UiEngine, led: Led) -> bool {
    engine.outputs().leds[led as usize]
}

#[test]
fn boots_into_the_error_blink() {
    let mut engine = UiEngine::new();
    // 1 Hz blink: five ticks on, five ticks off.
    for _ in 0..5 {
        engine.tick();
        assert!(led(&engine, Led::StatusRed));
    }
    for _ in 0..5 {
        engine.tick();
        assert!(!led(&engine, Led::StatusRed));
    }
    for _ in 0..5 {
        engine.tick();
        assert!(led(&engine, Led::StatusRed));
    }
}

#[test]
fn set_state_reaches_steady_state_immediately() {
    let mut engine = UiEngine::new();
    engine.handle(UiCommand::SetState(UiPersistent::Locked));
    engine.tick();

    assert!(led(&engine, Led::StatusGreen));
    assert!(led(&engine, Led::LockRed));
    assert!(!led(&engine, Led::StatusRed));
    assert!(!led(&engine, Led::LockGreen));
    assert_eq!(engine.outputs().buzzer_half_period, 0);

    // Steady: the pattern holds over any number of further ticks.
    for _ in 0..37 {
        engine.tick();
    }
    assert!(led(&engine, Led::StatusGreen));
    assert!(led(&engine, Led::LockRed));
}

#[test]
fn state_changes_clear_leftover_outputs() {
    let mut engine = UiEngine::new();
    engine.handle(UiCommand::SetState(UiPersistent::Unlocked));
    engine.tick();
    assert!(led(&engine, Led::LockGreen));

    // Unlocked -> Locked: the green lock LED has to go out even though
    // the Locked sequence never mentions it.
    engine.handle(UiCommand::SetState(UiPersistent::Locked));
    engine.tick();
    assert!(!led(&engine, Led::LockGreen));
    assert!(led(&engine, Led::LockRed));
}

#[test]
fn read_ok_flash_beeps_then_restores_the_persistent_state() {
    let mut engine = UiEngine::new();
    engine.handle(UiCommand::SetState(UiPersistent::Unlocked));
    engine.tick();

    engine.handle(UiCommand::Flash(UiFlash::ReadOk));
    // One second of the 880 Hz tone; the persistent tape is paused.
    for _ in 0..10 {
        engine.tick();
        assert_eq!(engine.outputs().buzzer_half_period, 1_000_000 / 880);
    }

    // The flash ends: outputs are cleared, then the persistent pattern
    // reasserts itself on the same tick.
    engine.tick();
    assert_eq!(engine.outputs().buzzer_half_period, 0);
    assert!(led(&engine, Led::StatusGreen));
    assert!(led(&engine, Led::LockGreen));
}

#[test]
fn read_fail_flash_pulses_three_times() {
    let mut engine = UiEngine::new();
    engine.handle(UiCommand::SetState(UiPersistent::Locked));
    engine.tick();

    engine.handle(UiCommand::Flash(UiFlash::ReadFail));
    let mut bursts = 0;
    let mut last_tone = 0;
    for _ in 0..12 {
        engine.tick();
        let tone = engine.outputs().buzzer_half_period;
        if tone != 0 && last_tone == 0 {
            bursts += 1;
            assert_eq!(tone, 1_000_000 / 220);
        }
        last_tone = tone;
    }
    assert_eq!(bursts, 3);

    // Flash over; the locked pattern comes back.
    engine.tick();
    assert_eq!(engine.outputs().buzzer_half_period, 0);
    assert!(led(&engine, Led::StatusGreen));
    assert!(led(&engine, Led::LockRed));
}

#[test]
fn a_new_flash_replaces_a_running_one() {
    let mut engine = UiEngine::new();
    engine.handle(UiCommand::SetState(UiPersistent::Locked));
    engine.tick();

    engine.handle(UiCommand::Flash(UiFlash::ReadFail));
    engine.tick();
    engine.handle(UiCommand::Flash(UiFlash::ReadOk));
    engine.tick();
    assert_eq!(engine.outputs().buzzer_half_period, 1_000_000 / 880);
}
