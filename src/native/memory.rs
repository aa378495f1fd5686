//! An in-process event log with the status-code semantics of the native service.

use super::{
    EventLogApi, INFINITE, NativeResult, QueryFlags, RawHandle, RenderContextKind, RenderFlags,
    Rendered, SYSTEM_PROPERTY_COUNT, SeekFlags, StartPosition, Status, SystemProperty, Variant,
};
use crate::err::{
    ERROR_EVT_CHANNEL_NOT_FOUND, ERROR_EVT_INVALID_CHANNEL_PATH, ERROR_EVT_INVALID_QUERY,
    ERROR_EVT_MESSAGE_NOT_FOUND, ERROR_EVT_PUBLISHER_METADATA_NOT_FOUND, ERROR_INVALID_HANDLE,
    ERROR_INVALID_PARAMETER, ERROR_NOT_FOUND, describe_status,
};
use crate::utils::encode_utf16le_bytes_z;
use crate::utils::windows::{format_system_time, parse_guid, parse_sid};
use crate::value::Value;

use log::{debug, warn};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event as XmlEvent;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// One stored event. The record id and channel are assigned when it is appended.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryRecord {
    pub provider_name: String,
    pub provider_guid: Option<String>,
    pub event_id: u16,
    pub qualifiers: Option<u16>,
    pub version: Option<u8>,
    pub level: Option<u8>,
    pub task: Option<u16>,
    pub opcode: Option<u8>,
    pub keywords: Option<u64>,
    /// FILETIME ticks (100ns since 1601-01-01 UTC).
    pub time_created: u64,
    pub activity_id: Option<String>,
    pub related_activity_id: Option<String>,
    pub process_id: u32,
    pub thread_id: u32,
    pub computer: String,
    /// Textual SID, e.g. `S-1-5-18`.
    pub user_id: Option<String>,
    pub data: Vec<Variant>,
    /// Message template, `%1`..`%N` are replaced with the data values.
    pub message: Option<String>,
}

impl MemoryRecord {
    pub fn new(provider_name: impl Into<String>, event_id: u16) -> Self {
        MemoryRecord {
            provider_name: provider_name.into(),
            event_id,
            computer: "localhost".to_string(),
            ..MemoryRecord::default()
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_time_created(mut self, filetime: u64) -> Self {
        self.time_created = filetime;
        self
    }

    pub fn with_data(mut self, data: Vec<Variant>) -> Self {
        self.data = data;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    channels: BTreeMap<String, Vec<MemoryRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Eq,
    Le,
    Lt,
    Ge,
    Gt,
}

impl Comparison {
    fn holds<T: PartialOrd>(&self, left: T, right: T) -> bool {
        match self {
            Comparison::Eq => left == right,
            Comparison::Le => left <= right,
            Comparison::Lt => left < right,
            Comparison::Ge => left >= right,
            Comparison::Gt => left > right,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    EventId(Comparison, u16),
    Level(Comparison, u8),
    Provider(String),
}

impl Condition {
    fn parse(term: &str) -> Option<Condition> {
        let term = term.trim();
        let term = term
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .unwrap_or(term)
            .trim();

        if let Some(rest) = term.strip_prefix("Provider[@Name=") {
            let name = rest
                .strip_suffix(']')?
                .trim()
                .trim_matches(|c: char| c == '\'' || c == '"');
            return Some(Condition::Provider(name.to_string()));
        }

        let compact: String = term.chars().filter(|c| !c.is_whitespace()).collect();
        let (field, op, value) = split_comparison(&compact)?;
        match field {
            "EventID" => Some(Condition::EventId(op, value.parse().ok()?)),
            "Level" => Some(Condition::Level(op, value.parse().ok()?)),
            _ => None,
        }
    }

    fn matches(&self, record: &MemoryRecord) -> bool {
        match self {
            Condition::EventId(op, id) => op.holds(record.event_id, *id),
            Condition::Level(op, level) => op.holds(record.level.unwrap_or(0), *level),
            Condition::Provider(name) => record.provider_name == *name,
        }
    }
}

fn split_comparison(term: &str) -> Option<(&str, Comparison, &str)> {
    let operators = [
        ("<=", Comparison::Le),
        (">=", Comparison::Ge),
        ("=", Comparison::Eq),
        ("<", Comparison::Lt),
        (">", Comparison::Gt),
    ];
    operators.iter().find_map(|(token, op)| {
        term.find(token)
            .map(|idx| (&term[..idx], *op, &term[idx + token.len()..]))
    })
}

/// The subset of structured queries understood by the in-memory log:
/// `*`, or `*[System[...]]` with `and`-joined `EventID`, `Level` and `Provider[@Name=...]` terms.
#[derive(Debug, Clone, PartialEq, Default)]
struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    fn parse(expr: &str) -> Option<Filter> {
        let expr = expr.trim();
        if expr.is_empty() || expr == "*" {
            return Some(Filter::default());
        }

        let inner = expr.strip_prefix("*[System[")?.strip_suffix("]]")?;
        let conditions = inner
            .split(" and ")
            .map(Condition::parse)
            .collect::<Option<Vec<_>>>()?;

        Some(Filter { conditions })
    }

    fn matches(&self, record: &MemoryRecord) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

enum Object {
    ChannelEnum {
        names: Vec<String>,
        position: usize,
    },
    Query {
        channel: String,
        /// `None` when the filter was malformed and errors were tolerated.
        filter: Option<Filter>,
        reverse: bool,
        /// Index (into the matching records) of the record the next `next` returns.
        position: usize,
    },
    Signal {
        set: bool,
    },
    Subscription {
        channel: String,
        filter: Filter,
        signal: RawHandle,
        next_record_id: u64,
    },
    Bookmark {
        position: Option<(String, u64)>,
    },
    Event {
        channel: String,
        record_id: u64,
    },
    RenderContext(RenderContextKind),
    PublisherMetadata,
}

#[derive(Default)]
struct State {
    /// Record ids are 1-based indices into each channel's vector.
    channels: BTreeMap<String, Vec<MemoryRecord>>,
    objects: HashMap<usize, Object>,
    last_handle: usize,
    rejected_closes: usize,
    render_drift: usize,
}

impl State {
    fn insert(&mut self, object: Object) -> RawHandle {
        self.last_handle += 4;
        let raw = 0x100 + self.last_handle;
        self.objects.insert(raw, object);
        RawHandle(raw)
    }

    fn event(&self, handle: RawHandle) -> NativeResult<(&str, u64, &MemoryRecord)> {
        match self.objects.get(&handle.0) {
            Some(Object::Event { channel, record_id }) => {
                let record = record_in(&self.channels, channel, *record_id)
                    .ok_or(Status::Failed(ERROR_INVALID_HANDLE))?;
                Ok((channel.as_str(), *record_id, record))
            }
            _ => Err(Status::Failed(ERROR_INVALID_HANDLE)),
        }
    }
}

fn record_in<'s>(
    channels: &'s BTreeMap<String, Vec<MemoryRecord>>,
    channel: &str,
    record_id: u64,
) -> Option<&'s MemoryRecord> {
    let index = usize::try_from(record_id.checked_sub(1)?).ok()?;
    channels.get(channel)?.get(index)
}

fn matching_ids(
    channels: &BTreeMap<String, Vec<MemoryRecord>>,
    channel: &str,
    filter: &Filter,
    reverse: bool,
) -> Vec<u64> {
    let mut ids: Vec<u64> = channels
        .get(channel)
        .map(|records| {
            records
                .iter()
                .enumerate()
                .filter(|(_, record)| filter.matches(record))
                .map(|(index, _)| index as u64 + 1)
                .collect()
        })
        .unwrap_or_default();
    if reverse {
        ids.reverse();
    }
    ids
}

fn next_matching(
    channels: &BTreeMap<String, Vec<MemoryRecord>>,
    channel: &str,
    filter: &Filter,
    from_record_id: u64,
) -> Option<u64> {
    let records = channels.get(channel)?;
    let start = from_record_id.saturating_sub(1) as usize;
    records
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, record)| filter.matches(record))
        .map(|(index, _)| index as u64 + 1)
}

/// Copies `bytes` out, or reports the size needed. `drift` under-reports sizes to mimic data
/// that grows between the sizing call and the fill.
fn copy_out(drift: &mut usize, buffer: &mut [u8], bytes: &[u8]) -> NativeResult<usize> {
    if buffer.len() < bytes.len() {
        let needed = if *drift > 0 {
            *drift -= 1;
            bytes.len().saturating_sub(2)
        } else {
            bytes.len()
        };
        return Err(Status::InsufficientBuffer { needed });
    }
    buffer[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

fn bookmark_markup(position: Option<&(String, u64)>) -> String {
    match position {
        Some((channel, record_id)) => format!(
            "<BookmarkList>\r\n  <Bookmark Channel='{}' RecordId='{}' IsCurrent='true'/>\r\n</BookmarkList>",
            escape(channel.as_str()),
            record_id
        ),
        None => "<BookmarkList>\r\n</BookmarkList>".to_string(),
    }
}

/// Returns `None` for markup that is not a bookmark list, `Some(None)` for an empty list.
fn parse_bookmark_markup(markup: &str) -> Option<Option<(String, u64)>> {
    let mut reader = Reader::from_str(markup);
    let mut seen_list = false;
    let mut position = None;

    loop {
        match reader.read_event().ok()? {
            XmlEvent::Start(e) | XmlEvent::Empty(e) => match e.name().as_ref() {
                b"BookmarkList" => seen_list = true,
                b"Bookmark" if seen_list => {
                    let mut channel = None;
                    let mut record_id = None;
                    let mut is_current = false;
                    for attr in e.attributes() {
                        let attr = attr.ok()?;
                        let value = attr.unescape_value().ok()?;
                        match attr.key.as_ref() {
                            b"Channel" => channel = Some(value.into_owned()),
                            b"RecordId" => record_id = Some(value.parse::<u64>().ok()?),
                            b"IsCurrent" => is_current = value == "true",
                            _ => {}
                        }
                    }
                    let entry = (channel?, record_id?);
                    if is_current || position.is_none() {
                        position = Some(entry);
                    }
                }
                _ => return None,
            },
            XmlEvent::Eof => break,
            _ => {}
        }
    }

    seen_list.then_some(position)
}

fn guid_variant(text: Option<&str>) -> Variant {
    match text {
        Some(text) => match parse_guid(text) {
            Some(bytes) => Variant::Guid(bytes),
            None => {
                warn!("Ignoring malformed GUID `{}`", text);
                Variant::Null
            }
        },
        None => Variant::Null,
    }
}

fn system_variants(channel: &str, record_id: u64, record: &MemoryRecord) -> Vec<Variant> {
    let mut values = vec![Variant::Null; SYSTEM_PROPERTY_COUNT];
    let mut set = |property: SystemProperty, value: Variant| values[property as usize] = value;

    set(
        SystemProperty::ProviderName,
        Variant::String(record.provider_name.clone()),
    );
    set(
        SystemProperty::ProviderGuid,
        guid_variant(record.provider_guid.as_deref()),
    );
    set(SystemProperty::EventId, Variant::UInt16(record.event_id));
    if let Some(qualifiers) = record.qualifiers {
        set(SystemProperty::Qualifiers, Variant::UInt16(qualifiers));
    }
    if let Some(level) = record.level {
        set(SystemProperty::Level, Variant::Byte(level));
    }
    if let Some(task) = record.task {
        set(SystemProperty::Task, Variant::UInt16(task));
    }
    if let Some(opcode) = record.opcode {
        set(SystemProperty::Opcode, Variant::Byte(opcode));
    }
    if let Some(keywords) = record.keywords {
        set(SystemProperty::Keywords, Variant::HexInt64(keywords));
    }
    set(
        SystemProperty::TimeCreated,
        Variant::FileTime(record.time_created),
    );
    set(SystemProperty::EventRecordId, Variant::UInt64(record_id));
    set(
        SystemProperty::ActivityId,
        guid_variant(record.activity_id.as_deref()),
    );
    set(
        SystemProperty::RelatedActivityId,
        guid_variant(record.related_activity_id.as_deref()),
    );
    set(SystemProperty::ProcessId, Variant::UInt32(record.process_id));
    set(SystemProperty::ThreadId, Variant::UInt32(record.thread_id));
    set(SystemProperty::Channel, Variant::String(channel.to_string()));
    set(
        SystemProperty::Computer,
        Variant::String(record.computer.clone()),
    );
    if let Some(sid) = record.user_id.as_deref().and_then(parse_sid) {
        set(SystemProperty::UserId, Variant::Sid(sid));
    }
    if let Some(version) = record.version {
        set(SystemProperty::Version, Variant::Byte(version));
    }

    values
}

fn event_xml(channel: &str, record_id: u64, record: &MemoryRecord) -> String {
    let mut xml = String::with_capacity(512);
    xml.push_str("<Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'><System>");

    xml += &format!("<Provider Name='{}'", escape(record.provider_name.as_str()));
    if let Some(guid) = &record.provider_guid {
        xml += &format!(" Guid='{}'", escape(guid.as_str()));
    }
    xml.push_str("/>");

    match record.qualifiers {
        Some(qualifiers) => {
            xml += &format!(
                "<EventID Qualifiers='{}'>{}</EventID>",
                qualifiers, record.event_id
            )
        }
        None => xml += &format!("<EventID>{}</EventID>", record.event_id),
    }
    xml += &format!(
        "<Version>{}</Version><Level>{}</Level><Task>{}</Task><Opcode>{}</Opcode><Keywords>0x{:x}</Keywords>",
        record.version.unwrap_or(0),
        record.level.unwrap_or(0),
        record.task.unwrap_or(0),
        record.opcode.unwrap_or(0),
        record.keywords.unwrap_or(0)
    );
    xml += &format!(
        "<TimeCreated SystemTime='{}'/>",
        format_system_time(record.time_created).unwrap_or_default()
    );
    xml += &format!("<EventRecordID>{}</EventRecordID>", record_id);

    xml.push_str("<Correlation");
    if let Some(activity_id) = &record.activity_id {
        xml += &format!(" ActivityID='{}'", escape(activity_id.as_str()));
    }
    if let Some(related) = &record.related_activity_id {
        xml += &format!(" RelatedActivityID='{}'", escape(related.as_str()));
    }
    xml.push_str("/>");

    xml += &format!(
        "<Execution ProcessID='{}' ThreadID='{}'/>",
        record.process_id, record.thread_id
    );
    xml += &format!(
        "<Channel>{}</Channel><Computer>{}</Computer>",
        escape(channel),
        escape(record.computer.as_str())
    );
    match &record.user_id {
        Some(sid) => xml += &format!("<Security UserID='{}'/>", escape(sid.as_str())),
        None => xml.push_str("<Security/>"),
    }
    xml.push_str("</System><EventData>");

    for value in &record.data {
        let text = Value::from(value.clone()).to_string();
        xml += &format!("<Data>{}</Data>", escape(text.as_str()));
    }
    xml.push_str("</EventData></Event>");
    xml
}

/// Replaces `%1`..`%N` with the matching data values.
fn expand_inserts(template: &str, data: &[Variant]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        match digits.parse::<usize>().ok().and_then(|n| n.checked_sub(1)) {
            Some(index) if index < data.len() => {
                out += &Value::from(data[index].clone()).to_string();
            }
            _ => {
                out.push('%');
                out.push_str(&digits);
            }
        }
    }
    out
}

/// An in-process [`EventLogApi`].
///
/// Channels hold appended [`MemoryRecord`]s. Queries, subscriptions, bookmarks, signals and
/// rendering behave like the native service, including its status codes. Every handle is
/// tracked, so [`MemoryEventLog::open_handle_count`] exposes leaks and closing an unknown handle
/// is rejected and counted by [`MemoryEventLog::rejected_close_count`].
#[derive(Default)]
pub struct MemoryEventLog {
    state: Mutex<State>,
    signalled: Condvar,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        MemoryEventLog::default()
    }

    /// Loads a snapshot of the form `{"channels": {"<name>": [<record>, ...]}}`.
    pub fn from_json_reader<R: Read>(reader: R) -> serde_json::Result<Self> {
        let snapshot: Snapshot = serde_json::from_reader(reader)?;
        let log = MemoryEventLog::new();
        for (channel, records) in snapshot.channels {
            log.add_channel(&channel);
            for record in records {
                log.append(&channel, record);
            }
        }
        Ok(log)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an empty channel, if it does not exist yet.
    pub fn add_channel(&self, channel: &str) {
        self.state().channels.entry(channel.to_string()).or_default();
    }

    /// Appends a record and wakes the subscriptions it matches. Returns its record id.
    pub fn append(&self, channel: &str, record: MemoryRecord) -> u64 {
        let mut guard = self.state();
        let state = &mut *guard;

        let records = state.channels.entry(channel.to_string()).or_default();
        records.push(record);
        let record_id = records.len() as u64;
        let record = &records[records.len() - 1];

        let signals: Vec<usize> = state
            .objects
            .values()
            .filter_map(|object| match object {
                Object::Subscription {
                    channel: subscribed,
                    filter,
                    signal,
                    next_record_id,
                } if subscribed == channel
                    && *next_record_id <= record_id
                    && filter.matches(record) =>
                {
                    Some(signal.0)
                }
                _ => None,
            })
            .collect();

        for signal in signals {
            if let Some(Object::Signal { set }) = state.objects.get_mut(&signal) {
                *set = true;
            }
        }
        drop(guard);
        self.signalled.notify_all();

        record_id
    }

    /// Number of handles currently open.
    pub fn open_handle_count(&self) -> usize {
        self.state().objects.len()
    }

    /// Number of close calls that named a handle which was not open.
    pub fn rejected_close_count(&self) -> usize {
        self.state().rejected_closes
    }

    /// Makes the next `times` "insufficient buffer" responses under-report the needed size.
    pub fn set_render_drift(&self, times: usize) {
        self.state().render_drift = times;
    }
}

impl EventLogApi for MemoryEventLog {
    fn open_channel_enum(&self) -> NativeResult<RawHandle> {
        let mut state = self.state();
        let names = state.channels.keys().cloned().collect();
        Ok(state.insert(Object::ChannelEnum { names, position: 0 }))
    }

    fn next_channel_path(&self, channel_enum: RawHandle, buffer: &mut [u8]) -> NativeResult<usize> {
        let mut guard = self.state();
        let state = &mut *guard;

        let Some(Object::ChannelEnum { names, position }) = state.objects.get_mut(&channel_enum.0)
        else {
            return Err(Status::Failed(ERROR_INVALID_HANDLE));
        };
        let name = names.get(*position).ok_or(Status::NoMoreItems)?;
        let used = copy_out(&mut state.render_drift, buffer, &encode_utf16le_bytes_z(name))?;
        *position += 1;
        Ok(used)
    }

    fn query(&self, path: &str, filter: &str, flags: QueryFlags) -> NativeResult<RawHandle> {
        if flags.contains(QueryFlags::FILE_PATH) {
            return Err(Status::Failed(ERROR_EVT_INVALID_CHANNEL_PATH));
        }

        let mut state = self.state();
        if !state.channels.contains_key(path) {
            return Err(Status::Failed(ERROR_EVT_CHANNEL_NOT_FOUND));
        }

        let parsed = Filter::parse(filter);
        if parsed.is_none() {
            if !flags.contains(QueryFlags::TOLERATE_QUERY_ERRORS) {
                return Err(Status::Failed(ERROR_EVT_INVALID_QUERY));
            }
            debug!("Tolerating malformed query `{}` on `{}`", filter, path);
        }

        Ok(state.insert(Object::Query {
            channel: path.to_string(),
            filter: parsed,
            reverse: flags.contains(QueryFlags::REVERSE_DIRECTION),
            position: 0,
        }))
    }

    fn create_signal(&self) -> NativeResult<RawHandle> {
        Ok(self.state().insert(Object::Signal { set: false }))
    }

    fn wait_signal(&self, signal: RawHandle, timeout: u32) -> NativeResult<bool> {
        let deadline = (timeout != INFINITE)
            .then(|| Instant::now() + Duration::from_millis(u64::from(timeout)));
        let mut state = self.state();

        loop {
            match state.objects.get_mut(&signal.0) {
                Some(Object::Signal { set }) => {
                    if *set {
                        *set = false;
                        return Ok(true);
                    }
                }
                _ => return Err(Status::Failed(ERROR_INVALID_HANDLE)),
            }

            match deadline {
                None => {
                    state = self
                        .signalled
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner)
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    state = self
                        .signalled
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn close_signal(&self, signal: RawHandle) -> NativeResult<()> {
        let mut state = self.state();
        match state.objects.remove(&signal.0) {
            Some(Object::Signal { .. }) => {
                drop(state);
                self.signalled.notify_all();
                Ok(())
            }
            Some(other) => {
                state.objects.insert(signal.0, other);
                state.rejected_closes += 1;
                Err(Status::Failed(ERROR_INVALID_HANDLE))
            }
            None => {
                state.rejected_closes += 1;
                Err(Status::Failed(ERROR_INVALID_HANDLE))
            }
        }
    }

    fn subscribe(
        &self,
        signal: RawHandle,
        path: &str,
        filter: &str,
        bookmark: Option<RawHandle>,
        start: StartPosition,
    ) -> NativeResult<RawHandle> {
        let mut guard = self.state();
        let state = &mut *guard;

        if !matches!(state.objects.get(&signal.0), Some(Object::Signal { .. })) {
            return Err(Status::Failed(ERROR_INVALID_HANDLE));
        }
        let Some(records) = state.channels.get(path) else {
            return Err(Status::Failed(ERROR_EVT_CHANNEL_NOT_FOUND));
        };
        let filter = Filter::parse(filter).ok_or(Status::Failed(ERROR_EVT_INVALID_QUERY))?;

        let next_record_id = match start {
            StartPosition::FutureEvents => records.len() as u64 + 1,
            StartPosition::OldestRecord => 1,
            StartPosition::AfterBookmark => {
                let handle = bookmark.ok_or(Status::Failed(ERROR_INVALID_PARAMETER))?;
                match state.objects.get(&handle.0) {
                    Some(Object::Bookmark {
                        position: Some((channel, record_id)),
                    }) if channel == path => record_id + 1,
                    Some(Object::Bookmark { .. }) => 1,
                    _ => return Err(Status::Failed(ERROR_INVALID_HANDLE)),
                }
            }
        };

        let pending = next_matching(&state.channels, path, &filter, next_record_id).is_some();
        if pending {
            if let Some(Object::Signal { set }) = state.objects.get_mut(&signal.0) {
                *set = true;
            }
        }
        debug!(
            "Subscribed to `{}` from record {} ({:?}, pending: {})",
            path, next_record_id, start, pending
        );

        Ok(state.insert(Object::Subscription {
            channel: path.to_string(),
            filter,
            signal,
            next_record_id,
        }))
    }

    fn next(&self, cursor: RawHandle, _timeout: u32) -> NativeResult<RawHandle> {
        let mut guard = self.state();
        let state = &mut *guard;

        let (channel, record_id) = match state.objects.get_mut(&cursor.0) {
            Some(Object::Query {
                channel,
                filter,
                reverse,
                position,
            }) => {
                let filter = filter
                    .as_ref()
                    .ok_or(Status::Failed(ERROR_EVT_INVALID_QUERY))?;
                let ids = matching_ids(&state.channels, channel, filter, *reverse);
                let record_id = *ids.get(*position).ok_or(Status::NoMoreItems)?;
                *position += 1;
                (channel.clone(), record_id)
            }
            Some(Object::Subscription {
                channel,
                filter,
                next_record_id,
                ..
            }) => {
                let record_id = next_matching(&state.channels, channel, filter, *next_record_id)
                    .ok_or(Status::NoMoreItems)?;
                *next_record_id = record_id + 1;
                (channel.clone(), record_id)
            }
            _ => return Err(Status::Failed(ERROR_INVALID_HANDLE)),
        };

        Ok(state.insert(Object::Event { channel, record_id }))
    }

    /// Positions the query so that the next `next` returns the record at `origin + offset`.
    /// The "current" origin is the record the next `next` would return.
    fn seek(
        &self,
        query: RawHandle,
        offset: i64,
        bookmark: Option<RawHandle>,
        _timeout: u32,
        flags: SeekFlags,
    ) -> NativeResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;

        let bookmarked = match bookmark {
            Some(handle) => match state.objects.get(&handle.0) {
                Some(Object::Bookmark { position }) => position.clone(),
                _ => return Err(Status::Failed(ERROR_INVALID_HANDLE)),
            },
            None => None,
        };

        let Some(Object::Query {
            channel,
            filter,
            reverse,
            position,
        }) = state.objects.get_mut(&query.0)
        else {
            return Err(Status::Failed(ERROR_INVALID_HANDLE));
        };
        let filter = filter
            .as_ref()
            .ok_or(Status::Failed(ERROR_EVT_INVALID_QUERY))?;
        let ids = matching_ids(&state.channels, channel, filter, *reverse);
        let len = ids.len() as i64;

        let base = match flags.origin() {
            1 => 0,
            2 => len - 1,
            3 => *position as i64,
            4 => {
                let (bookmark_channel, bookmark_id) =
                    bookmarked.ok_or(Status::Failed(ERROR_INVALID_PARAMETER))?;
                if bookmark_channel != *channel {
                    return Err(Status::Failed(ERROR_NOT_FOUND));
                }
                ids.iter()
                    .position(|&id| id == bookmark_id)
                    .ok_or(Status::Failed(ERROR_NOT_FOUND))? as i64
            }
            _ => return Err(Status::Failed(ERROR_INVALID_PARAMETER)),
        };

        // Overflowing offsets are out of range in the direction of their sign.
        let target = base
            .checked_add(offset)
            .unwrap_or(if offset < 0 { -1 } else { len });
        if (target < 0 || target >= len) && flags.is_strict() {
            return Err(Status::Failed(ERROR_NOT_FOUND));
        }
        *position = target.clamp(0, len) as usize;
        Ok(())
    }

    fn create_render_context(&self, kind: RenderContextKind) -> NativeResult<RawHandle> {
        match kind {
            RenderContextKind::System | RenderContextKind::User => {
                Ok(self.state().insert(Object::RenderContext(kind)))
            }
            RenderContextKind::Values => Err(Status::Failed(ERROR_INVALID_PARAMETER)),
        }
    }

    fn render(
        &self,
        context: Option<RawHandle>,
        fragment: RawHandle,
        flags: RenderFlags,
        buffer: &mut [u8],
    ) -> NativeResult<Rendered> {
        let mut guard = self.state();
        let state = &mut *guard;

        let (bytes, property_count) = match flags {
            RenderFlags::Bookmark => match state.objects.get(&fragment.0) {
                Some(Object::Bookmark { position }) => (
                    encode_utf16le_bytes_z(&bookmark_markup(position.as_ref())),
                    0,
                ),
                _ => return Err(Status::Failed(ERROR_INVALID_HANDLE)),
            },
            RenderFlags::EventXml => {
                let (channel, record_id, record) = state.event(fragment)?;
                (
                    encode_utf16le_bytes_z(&event_xml(channel, record_id, record)),
                    0,
                )
            }
            RenderFlags::EventValues => {
                let kind = match context.and_then(|c| state.objects.get(&c.0)) {
                    Some(Object::RenderContext(kind)) => *kind,
                    _ => return Err(Status::Failed(ERROR_INVALID_PARAMETER)),
                };
                let (channel, record_id, record) = state.event(fragment)?;
                let values = match kind {
                    RenderContextKind::System => system_variants(channel, record_id, record),
                    RenderContextKind::User => record.data.clone(),
                    RenderContextKind::Values => {
                        return Err(Status::Failed(ERROR_INVALID_PARAMETER));
                    }
                };
                let bytes = serde_json::to_vec(&values)
                    .map_err(|_| Status::Failed(ERROR_INVALID_PARAMETER))?;
                (bytes, values.len())
            }
        };

        let used = copy_out(&mut state.render_drift, buffer, &bytes)?;
        Ok(Rendered {
            used,
            property_count,
        })
    }

    fn read_values(&self, buffer: &[u8], count: usize) -> NativeResult<Vec<Variant>> {
        let values: Vec<Variant> =
            serde_json::from_slice(buffer).map_err(|_| Status::Failed(ERROR_INVALID_PARAMETER))?;
        if values.len() != count {
            return Err(Status::Failed(ERROR_INVALID_PARAMETER));
        }
        Ok(values)
    }

    fn create_bookmark(&self, markup: Option<&str>) -> NativeResult<RawHandle> {
        let position = match markup {
            Some(markup) => {
                parse_bookmark_markup(markup).ok_or(Status::Failed(ERROR_INVALID_PARAMETER))?
            }
            None => None,
        };
        Ok(self.state().insert(Object::Bookmark { position }))
    }

    fn update_bookmark(&self, bookmark: RawHandle, event: RawHandle) -> NativeResult<()> {
        let mut state = self.state();
        let (channel, record_id, _) = state.event(event)?;
        let channel = channel.to_string();

        match state.objects.get_mut(&bookmark.0) {
            Some(Object::Bookmark { position }) => {
                *position = Some((channel, record_id));
                Ok(())
            }
            _ => Err(Status::Failed(ERROR_INVALID_HANDLE)),
        }
    }

    fn open_publisher_metadata(&self, provider: &str) -> NativeResult<RawHandle> {
        let mut state = self.state();
        let known = state
            .channels
            .values()
            .flatten()
            .any(|record| record.provider_name == provider);
        if !known {
            return Err(Status::Failed(ERROR_EVT_PUBLISHER_METADATA_NOT_FOUND));
        }
        Ok(state.insert(Object::PublisherMetadata))
    }

    fn format_event_message(
        &self,
        metadata: RawHandle,
        event: RawHandle,
        buffer: &mut [u8],
    ) -> NativeResult<usize> {
        let mut guard = self.state();
        let state = &mut *guard;

        if !matches!(
            state.objects.get(&metadata.0),
            Some(Object::PublisherMetadata)
        ) {
            return Err(Status::Failed(ERROR_INVALID_HANDLE));
        }
        let (_, _, record) = state.event(event)?;
        let template = record
            .message
            .as_deref()
            .ok_or(Status::Failed(ERROR_EVT_MESSAGE_NOT_FOUND))?;
        let bytes = encode_utf16le_bytes_z(&expand_inserts(template, &record.data));

        copy_out(&mut state.render_drift, buffer, &bytes)
    }

    fn close(&self, handle: RawHandle) -> NativeResult<()> {
        let mut state = self.state();
        match state.objects.remove(&handle.0) {
            Some(Object::Signal { set }) => {
                state.objects.insert(handle.0, Object::Signal { set });
                state.rejected_closes += 1;
                Err(Status::Failed(ERROR_INVALID_HANDLE))
            }
            Some(_) => Ok(()),
            None => {
                state.rejected_closes += 1;
                Err(Status::Failed(ERROR_INVALID_HANDLE))
            }
        }
    }

    fn format_message(&self, code: u32) -> String {
        describe_status(code)
    }
}
