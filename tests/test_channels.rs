
use fixtures::*;

use pretty_assertions::assert_eq;

#[test]
fn test_lists_every_channel() {
    let (mem, log) = snapshot_log();
    {
        let names: Vec<String> = log.channels().unwrap().map(Result::unwrap).collect();
        assert_eq!(names, vec!["Application", "Security", "System"]);
    }
    assert_no_leaks(&mem);
}

#[test]
fn test_empty_log_has_no_channels() {
    ensure_env_logger_initialized();
    let log = winevt::EventLog::with_api(winevt::MemoryEventLog::new());

    assert_eq!(log.channels().unwrap().count(), 0);
}

#[test]
fn test_channel_names_survive_a_growing_buffer() {
    let (mem, log) = snapshot_log();
    mem.set_render_drift(2);

    let names: Vec<String> = log.channels().unwrap().map(Result::unwrap).collect();
    assert_eq!(names.len(), 3);
    assert_no_leaks(&mem);
}
