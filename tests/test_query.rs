
use fixtures::*;

use pretty_assertions::assert_eq;
use winevt::{EvtError, QueryDirection, RenderMode, SeekFlags, SeekTarget};
use winevt::err::{ERROR_EVT_INVALID_QUERY, ERROR_INSUFFICIENT_BUFFER};

fn is_time_created(text: &str) -> bool {
    // \d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{9}
    let shape = "dddd/dd/dd dd:dd:dd.ddddddddd";
    text.len() == shape.len()
        && text.chars().zip(shape.chars()).all(|(c, s)| match s {
            'd' => c.is_ascii_digit(),
            _ => c == s,
        })
}

fn record_ids(query: &mut winevt::Query) -> Vec<u64> {
    let mut ids = vec![];
    while query.advance().unwrap() {
        let record = query.render().unwrap().into_structured().unwrap();
        ids.push(record.system.event_record_id.unwrap());
    }
    ids
}

#[test]
fn test_application_scenario() {
    let (mem, log) = snapshot_log();
    {
        let mut query = log
            .query("Application", "*")
            .unwrap()
            .with_timeout(1000)
            .with_render_mode(RenderMode::Structured);

        assert!(query.advance().unwrap());
        let record = query.render().unwrap().into_structured().unwrap();

        assert_eq!(record.system.channel, "Application");
        let time_created = record.system.time_created.unwrap();
        assert!(is_time_created(&time_created), "{}", time_created);
        assert_eq!(time_created, "2024/03/01 08:15:00.123456700");
    }
    assert_no_leaks(&mem);
}

#[test]
fn test_record_ids_are_monotonic() {
    let (mem, log) = application_log(25);
    {
        let mut query = log
            .query("Application", "*")
            .unwrap()
            .with_render_mode(RenderMode::Structured);

        let ids = record_ids(&mut query);
        assert_eq!(ids.len(), 25);
        assert!(ids.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", ids);
    }
    assert_no_leaks(&mem);
}

#[test]
fn test_reverse_direction_yields_newest_first() {
    let (_mem, log) = application_log(5);
    let mut query = log
        .query_with_direction("Application", "*", QueryDirection::Reverse)
        .unwrap()
        .with_render_mode(RenderMode::Structured);

    assert_eq!(record_ids(&mut query), vec![5, 4, 3, 2, 1]);
}

#[test]
fn test_seek_first_returns_smallest_record_id() {
    let (_mem, log) = application_log(10);
    let mut query = log
        .query("Application", "*")
        .unwrap()
        .with_render_mode(RenderMode::Structured);

    // move somewhere in the middle first
    for _ in 0..6 {
        assert!(query.advance().unwrap());
    }
    assert!(query.seek_to("first").unwrap());
    assert!(query.advance().unwrap());

    let record = query.render().unwrap().into_structured().unwrap();
    assert_eq!(record.system.event_record_id, Some(1));
}

#[test]
fn test_seek_last_with_negative_offset() {
    let (_mem, log) = application_log(10);
    let mut query = log
        .query("Application", "*")
        .unwrap()
        .with_offset(-2)
        .with_render_mode(RenderMode::Structured);

    assert!(query.seek(SeekTarget::Origin(SeekFlags::RELATIVE_TO_LAST)));
    assert_eq!(record_ids(&mut query), vec![8, 9, 10]);
}

#[test]
fn test_strict_seek_out_of_range_is_rejected() {
    let (_mem, log) = application_log(3);
    let mut query = log.query("Application", "*").unwrap().with_offset(5);

    assert!(!query.seek_to("first|strict").unwrap());
    // a non-strict seek clamps to the end instead
    assert!(query.seek_to("first").unwrap());
    assert!(!query.advance().unwrap());
}

#[test]
fn test_seek_to_bookmark() {
    let (_mem, log) = application_log(6);
    let mut bookmark = log.bookmark().unwrap();
    {
        let mut query = log.query("Application", "*").unwrap();
        for _ in 0..4 {
            assert!(query.advance().unwrap());
        }
        bookmark.update(query.current().unwrap()).unwrap();
    }

    let mut query = log
        .query("Application", "*")
        .unwrap()
        .with_offset(1)
        .with_render_mode(RenderMode::Structured);
    assert!(query.seek(SeekTarget::Bookmark(&bookmark)));
    assert_eq!(record_ids(&mut query), vec![5, 6]);
}

#[test]
fn test_filter_selects_records() {
    let (_mem, log) = application_log(8);
    let mut query = log
        .query("Application", "*[System[(Level <= 2)]]")
        .unwrap()
        .with_render_mode(RenderMode::Structured);

    // levels cycle 1, 2, 3, 4
    assert_eq!(record_ids(&mut query), vec![1, 2, 5, 6]);
}

#[test]
fn test_malformed_filter_fails_on_advance() {
    let (mem, log) = application_log(3);
    {
        let mut query = log.query("Application", "*[System[").unwrap();

        let err = query.advance().unwrap_err();
        assert_eq!(err.code(), Some(ERROR_EVT_INVALID_QUERY));
        assert!(query.current().is_none());
    }
    assert_no_leaks(&mem);
}

#[test]
fn test_records_iterator_renders_every_record() {
    let (_mem, log) = snapshot_log();
    let mut query = log.query("System", "*").unwrap();

    let rendered: Vec<String> = query
        .records()
        .map(|record| record.unwrap().as_xml().unwrap().to_string())
        .collect();

    assert_eq!(rendered.len(), 2);
    assert!(rendered[0].contains("<Provider Name='Service Control Manager'"));
    assert!(rendered[1].contains("<EventRecordID>2</EventRecordID>"));
}

#[test]
fn test_message_and_string_inserts() {
    let (_mem, log) = snapshot_log();
    let mut query = log.query("System", "*").unwrap();

    assert!(query.advance().unwrap());
    assert_eq!(
        query.render_message().unwrap(),
        "The Windows Update service entered the running state."
    );
    assert_eq!(
        query.string_inserts().unwrap(),
        vec!["Windows Update".to_string(), "running".to_string()]
    );

    // the kernel record has no message
    assert!(query.advance().unwrap());
    assert!(matches!(
        query.render_message(),
        Err(EvtError::NativeCallFailed { .. })
    ));
    assert!(query.string_inserts().unwrap().is_empty());
}

#[test]
fn test_render_survives_growing_records() {
    let (mem, log) = application_log(1);
    let mut query = log.query("Application", "*").unwrap();
    assert!(query.advance().unwrap());

    mem.set_render_drift(2);
    assert!(query.render().unwrap().as_xml().is_some());

    mem.set_render_drift(3);
    let err = query.render().unwrap_err();
    assert_eq!(err.code(), Some(ERROR_INSUFFICIENT_BUFFER));
}

#[test]
fn test_seek_with_extreme_offsets_does_not_break_the_log() {
    let (mem, log) = application_log(3);
    {
        let mut query = log
            .query("Application", "*")
            .unwrap()
            .with_offset(i64::MAX)
            .with_render_mode(RenderMode::Structured);

        assert!(!query.seek_to("last|strict").unwrap());
        assert!(query.seek(SeekTarget::Origin(SeekFlags::RELATIVE_TO_LAST)));
        assert!(!query.advance().unwrap());

        query.set_offset(i64::MIN);
        assert!(query.seek_to("last").unwrap());
        assert_eq!(record_ids(&mut query), vec![1, 2, 3]);
    }
    assert_no_leaks(&mem);
}
