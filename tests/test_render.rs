
use fixtures::*;

use pretty_assertions::assert_eq;
use serde_json::json;
use winevt::{MemoryEventLog, MemoryRecord, RenderMode, Value, Variant};

fn render_single(record: MemoryRecord) -> winevt::StructuredRecord {
    ensure_env_logger_initialized();
    let mem = std::sync::Arc::new(MemoryEventLog::new());
    mem.append("Application", record);
    let log = winevt::EventLog::from_shared(mem.clone());

    let mut query = log
        .query("Application", "*")
        .unwrap()
        .with_render_mode(RenderMode::Structured);
    assert!(query.advance().unwrap());
    query.render().unwrap().into_structured().unwrap()
}

#[test]
fn test_values_keep_their_native_types() {
    let data = vec![
        Variant::String("svc".to_string()),
        Variant::SByte(-3),
        Variant::Byte(200),
        Variant::Int16(-300),
        Variant::UInt16(60_000),
        Variant::Int32(-70_000),
        Variant::UInt32(4_000_000_000),
        Variant::Int64(-5_000_000_000),
        Variant::UInt64(18_000_000_000_000_000_000),
        Variant::Double(0.5),
        Variant::Boolean(true),
        Variant::Binary(vec![0xde, 0xad, 0x0b]),
        Variant::FileTime(SAMPLE_FILETIME),
    ];
    let record = render_single(MemoryRecord::new("App", 1).with_data(data.clone()));

    assert_eq!(record.data.len(), data.len());
    assert_eq!(
        record.data,
        vec![
            Value::String("svc".to_string()),
            Value::Int8(-3),
            Value::UInt8(200),
            Value::Int16(-300),
            Value::UInt16(60_000),
            Value::Int32(-70_000),
            Value::UInt32(4_000_000_000),
            Value::Int64(-5_000_000_000),
            Value::UInt64(18_000_000_000_000_000_000),
            Value::Float64(0.5),
            Value::Boolean(true),
            Value::Binary("DEAD0B".to_string()),
            Value::Unknown(17),
        ]
    );
}

#[test]
fn test_system_fields_of_snapshot_record() {
    let (_mem, log) = snapshot_log();
    let mut query = log
        .query("Security", "*")
        .unwrap()
        .with_render_mode(RenderMode::Structured);
    assert!(query.advance().unwrap());

    let record = query.render().unwrap().into_structured().unwrap();
    let system = &record.system;
    assert_eq!(system.provider_name, "Microsoft-Windows-Security-Auditing");
    assert_eq!(
        system.provider_guid.as_deref(),
        Some("{54849625-5478-4994-A5BA-3E3B0328C30D}")
    );
    assert_eq!(system.event_id, 4624);
    assert_eq!(system.version, 2);
    assert_eq!(system.task, 12544);
    assert_eq!(system.keywords.as_deref(), Some("0x8020000000000000"));
    assert_eq!(
        system.correlation_activity_id.as_deref(),
        Some("{B5A3A1C0-8E6C-0001-52A2-A3B56C8EDA01}")
    );
    assert_eq!(system.correlation_related_activity_id, None);
    assert_eq!(system.security_user_id, None);
    assert_eq!(system.computer, "WORKSTATION-07");
}

#[test]
fn test_qualifiers_are_folded_into_event_id() {
    let (_mem, log) = snapshot_log();
    let mut query = log
        .query("System", "*[System[Provider[@Name='Service Control Manager']]]")
        .unwrap()
        .with_render_mode(RenderMode::Structured);
    assert!(query.advance().unwrap());

    let record = query.render().unwrap().into_structured().unwrap();
    assert_eq!(record.system.event_id, (16384 << 16) | 7036);
    assert!(!query.advance().unwrap());
}

#[test]
fn test_json_document() {
    let mut record = MemoryRecord::new("MsiInstaller", 11707)
        .with_level(4)
        .with_time_created(SAMPLE_FILETIME)
        .with_data(vec![
            Variant::String("done".to_string()),
            Variant::UInt32(0),
        ]);
    record.process_id = 7780;
    record.thread_id = 7784;
    record.user_id = Some("S-1-5-18".to_string());

    let json = render_single(record).to_json_value();
    assert_eq!(
        json,
        json!({
            "ProviderName": "MsiInstaller",
            "ProviderGuid": null,
            "EventID": 11707,
            "Version": 0,
            "Level": 4,
            "Task": 0,
            "Opcode": 0,
            "Keywords": null,
            "TimeCreated": "2024/03/01 08:15:00.123456700",
            "EventRecordID": 1,
            "ProcessID": 7780,
            "ThreadID": 7784,
            "Channel": "Application",
            "Computer": "localhost",
            "SecurityUserID": "S-1-5-18",
            "Data": ["done", 0],
        })
    );

    let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
    assert_eq!(keys.first().map(|k| k.as_str()), Some("ProviderName"));
    assert_eq!(keys.last().map(|k| k.as_str()), Some("Data"));
}

#[test]
fn test_xml_rendering_of_snapshot_record() {
    let (_mem, log) = snapshot_log();
    let mut query = log.query("Application", "*[System[(EventID=11707)]]").unwrap();
    assert!(query.advance().unwrap());

    let xml = query.render().unwrap().as_xml().unwrap().to_string();
    assert!(xml.starts_with("<Event xmlns="), "{}", xml);
    assert!(xml.contains("<EventID>11707</EventID>"), "{}", xml);
    assert!(xml.contains("<TimeCreated SystemTime='2024-03-01T08:16:00.1234567Z'/>"), "{}", xml);
    assert!(
        xml.contains("<Security UserID='S-1-5-21-3623811015-3361044348-30300820-1013'/>"),
        "{}",
        xml
    );
    assert!(xml.ends_with("</EventData></Event>"), "{}", xml);
}
