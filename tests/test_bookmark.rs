
use fixtures::*;

use pretty_assertions::assert_eq;
use winevt::EvtError;

#[test]
fn test_markup_roundtrips() {
    let (mem, log) = application_log(3);
    {
        let mut query = log.query("Application", "*").unwrap();
        let mut bookmark = log.bookmark().unwrap();
        assert!(query.advance().unwrap());
        assert!(query.advance().unwrap());
        bookmark.update(query.current().unwrap()).unwrap();

        let markup = bookmark.render().unwrap();
        let restored = log.bookmark_from(&markup).unwrap();
        assert_eq!(restored.render().unwrap(), markup);
        assert_eq!(bookmark.record_count(), 1);
        assert_eq!(restored.record_count(), 0);
    }
    assert_no_leaks(&mem);
}

#[test]
fn test_fresh_bookmark_roundtrips() {
    let (_mem, log) = application_log(0);
    let markup = log.bookmark().unwrap().render().unwrap();

    assert_eq!(log.bookmark_from(&markup).unwrap().render().unwrap(), markup);
}

#[test]
fn test_garbage_markup_is_invalid_format() {
    let (mem, log) = application_log(0);

    let err = log.bookmark_from("<NotABookmark/>").unwrap_err();
    assert!(matches!(err, EvtError::InvalidFormat { .. }), "{:?}", err);
    assert_no_leaks(&mem);
}

#[test]
fn test_explicit_close() {
    let (mem, log) = application_log(0);
    let bookmark = log.bookmark().unwrap();
    assert_eq!(mem.open_handle_count(), 1);

    bookmark.close().unwrap();
    assert_no_leaks(&mem);
}
