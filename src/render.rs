//! Turning record handles into markup or typed fields.

use crate::buffer::fill_required;
use crate::err::{EvtError, Result};
use crate::handle::{EvtHandle, HandleKind};
use crate::native::{EventLogApi, RawHandle, RenderContextKind, RenderFlags, SystemProperty, Variant};
use crate::utils::decode_utf16le_bytes_z;
use crate::utils::windows::{SidRef, format_guid, format_time_created};
use crate::value::Value;

use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Output format of `render` on a query or subscription.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderMode {
    /// The record's event markup.
    #[default]
    Xml,
    /// System fields plus typed user-data values.
    Structured,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RenderedRecord {
    Xml(String),
    Structured(StructuredRecord),
}

impl RenderedRecord {
    pub fn as_xml(&self) -> Option<&str> {
        match self {
            RenderedRecord::Xml(xml) => Some(xml),
            RenderedRecord::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&StructuredRecord> {
        match self {
            RenderedRecord::Structured(record) => Some(record),
            RenderedRecord::Xml(_) => None,
        }
    }

    pub fn into_structured(self) -> Option<StructuredRecord> {
        match self {
            RenderedRecord::Structured(record) => Some(record),
            RenderedRecord::Xml(_) => None,
        }
    }
}

/// The fixed metadata every record carries, in its documented order.
///
/// The correlation IDs and the user SID are only present when the record has them.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SystemFields {
    pub provider_name: String,
    pub provider_guid: Option<String>,
    /// `qualifiers << 16 | id`
    #[serde(rename = "EventID")]
    pub event_id: u32,
    pub version: u8,
    pub level: u8,
    pub task: u16,
    pub opcode: u8,
    pub keywords: Option<String>,
    pub time_created: Option<String>,
    #[serde(rename = "EventRecordID")]
    pub event_record_id: Option<u64>,
    #[serde(
        rename = "CorrelationActivityID",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_activity_id: Option<String>,
    #[serde(
        rename = "CorrelationRelatedActivityID",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_related_activity_id: Option<String>,
    #[serde(rename = "ProcessID")]
    pub process_id: u32,
    #[serde(rename = "ThreadID")]
    pub thread_id: u32,
    pub channel: String,
    pub computer: String,
    #[serde(rename = "SecurityUserID", skip_serializing_if = "Option::is_none")]
    pub security_user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuredRecord {
    #[serde(flatten)]
    pub system: SystemFields,
    #[serde(rename = "Data")]
    pub data: Vec<Value>,
}

impl StructuredRecord {
    /// The system fields as a JSON object with the typed values appended under `Data`.
    pub fn to_json_value(&self) -> serde_json::Value {
        let mut object = match serde_json::to_value(&self.system) {
            Ok(serde_json::Value::Object(object)) => object,
            _ => serde_json::Map::new(),
        };
        object.insert(
            "Data".to_string(),
            serde_json::Value::Array(self.data.iter().map(serde_json::Value::from).collect()),
        );
        serde_json::Value::Object(object)
    }
}

fn text(value: &Variant) -> Option<String> {
    match value {
        Variant::String(s) | Variant::AnsiString(s) => Some(s.clone()),
        _ => None,
    }
}

fn unsigned(value: &Variant) -> Option<u64> {
    match *value {
        Variant::Byte(v) => Some(u64::from(v)),
        Variant::UInt16(v) => Some(u64::from(v)),
        Variant::UInt32(v) | Variant::HexInt32(v) => Some(u64::from(v)),
        Variant::UInt64(v) | Variant::HexInt64(v) | Variant::SizeT(v) => Some(v),
        _ => None,
    }
}

fn guid(value: &Variant) -> Option<String> {
    match value {
        Variant::Guid(bytes) => Some(format_guid(bytes)),
        _ => None,
    }
}

/// Builds the system fields out of the values of a system render context.
pub(crate) fn system_fields(values: &[Variant]) -> SystemFields {
    let get = |property: SystemProperty| values.get(property as usize).unwrap_or(&Variant::Null);

    let id = unsigned(get(SystemProperty::EventId)).unwrap_or(0) as u32 & 0xffff;
    let event_id = match unsigned(get(SystemProperty::Qualifiers)) {
        Some(qualifiers) => ((qualifiers as u32) << 16) | id,
        None => id,
    };

    let time_created = match get(SystemProperty::TimeCreated) {
        Variant::FileTime(ticks) => format_time_created(*ticks),
        _ => None,
    };

    let security_user_id = match get(SystemProperty::UserId) {
        Variant::Sid(bytes) => Some(SidRef::new(bytes).to_string()),
        _ => None,
    };

    SystemFields {
        provider_name: text(get(SystemProperty::ProviderName)).unwrap_or_default(),
        provider_guid: guid(get(SystemProperty::ProviderGuid)),
        event_id,
        version: unsigned(get(SystemProperty::Version)).unwrap_or(0) as u8,
        level: unsigned(get(SystemProperty::Level)).unwrap_or(0) as u8,
        task: unsigned(get(SystemProperty::Task)).unwrap_or(0) as u16,
        opcode: unsigned(get(SystemProperty::Opcode)).unwrap_or(0) as u8,
        keywords: unsigned(get(SystemProperty::Keywords)).map(|k| format!("0x{:016x}", k)),
        time_created,
        event_record_id: unsigned(get(SystemProperty::EventRecordId)),
        correlation_activity_id: guid(get(SystemProperty::ActivityId)),
        correlation_related_activity_id: guid(get(SystemProperty::RelatedActivityId)),
        process_id: unsigned(get(SystemProperty::ProcessId)).unwrap_or(0) as u32,
        thread_id: unsigned(get(SystemProperty::ThreadId)).unwrap_or(0) as u32,
        channel: text(get(SystemProperty::Channel)).unwrap_or_default(),
        computer: text(get(SystemProperty::Computer)).unwrap_or_default(),
        security_user_id,
    }
}

/// Renders `fragment` (a record or a bookmark) to its markup.
pub(crate) fn render_markup(
    api: &Arc<dyn EventLogApi>,
    fragment: RawHandle,
    flags: RenderFlags,
) -> Result<String> {
    let (buffer, rendered) = fill_required(api.as_ref(), "EvtRender", |buf| {
        api.render(None, fragment, flags, buf)
    })?;
    let used = rendered.used.min(buffer.len());
    Ok(decode_utf16le_bytes_z(&buffer.as_bytes()[..used]))
}

/// Renders records for one cursor. Render contexts and publisher metadata are opened on first
/// use and kept for the cursor's lifetime.
pub(crate) struct Renderer {
    api: Arc<dyn EventLogApi>,
    system_context: Option<EvtHandle>,
    user_context: Option<EvtHandle>,
    publishers: HashMap<String, EvtHandle>,
}

impl Renderer {
    pub(crate) fn new(api: &Arc<dyn EventLogApi>) -> Self {
        Renderer {
            api: Arc::clone(api),
            system_context: None,
            user_context: None,
            publishers: HashMap::new(),
        }
    }

    pub(crate) fn render(&mut self, record: &EvtHandle, mode: RenderMode) -> Result<RenderedRecord> {
        match mode {
            RenderMode::Xml => self.render_xml(record).map(RenderedRecord::Xml),
            RenderMode::Structured => self.render_structured(record).map(RenderedRecord::Structured),
        }
    }

    pub(crate) fn render_xml(&self, record: &EvtHandle) -> Result<String> {
        render_markup(&self.api, record.raw(), RenderFlags::EventXml)
    }

    pub(crate) fn render_structured(&mut self, record: &EvtHandle) -> Result<StructuredRecord> {
        let system = self.render_system(record)?;
        let data = self
            .render_values(record, RenderContextKind::User)?
            .into_iter()
            .map(Value::from)
            .collect();

        Ok(StructuredRecord { system, data })
    }

    pub(crate) fn render_system(&mut self, record: &EvtHandle) -> Result<SystemFields> {
        let values = self.render_values(record, RenderContextKind::System)?;
        Ok(system_fields(&values))
    }

    /// The user-data values as display strings.
    pub(crate) fn string_inserts(&mut self, record: &EvtHandle) -> Result<Vec<String>> {
        Ok(self
            .render_values(record, RenderContextKind::User)?
            .into_iter()
            .map(|v| Value::from(v).to_string())
            .collect())
    }

    /// The record's message, formatted from its provider's message table.
    pub(crate) fn render_message(&mut self, record: &EvtHandle) -> Result<String> {
        let provider = self.render_system(record)?.provider_name;
        let metadata = self.publisher(&provider)?;

        let api = &self.api;
        let (buffer, used) = fill_required(api.as_ref(), "EvtFormatMessage", |buf| {
            api.format_event_message(metadata, record.raw(), buf)
        })?;
        Ok(decode_utf16le_bytes_z(&buffer.as_bytes()[..used.min(buffer.len())]))
    }

    fn render_values(&mut self, record: &EvtHandle, kind: RenderContextKind) -> Result<Vec<Variant>> {
        let context = self.context(kind)?;

        let api = &self.api;
        let (buffer, rendered) = fill_required(api.as_ref(), "EvtRender", |buf| {
            api.render(Some(context), record.raw(), RenderFlags::EventValues, buf)
        })?;
        let used = rendered.used.min(buffer.len());

        api.read_values(&buffer.as_bytes()[..used], rendered.property_count)
            .map_err(|status| EvtError::native(api.as_ref(), "EvtRender", status))
    }

    fn context(&mut self, kind: RenderContextKind) -> Result<RawHandle> {
        let slot = match kind {
            RenderContextKind::User => &mut self.user_context,
            _ => &mut self.system_context,
        };
        if let Some(context) = slot.as_ref() {
            return Ok(context.raw());
        }

        let raw = self
            .api
            .create_render_context(kind)
            .map_err(|status| EvtError::native(self.api.as_ref(), "EvtCreateRenderContext", status))?;
        let context = EvtHandle::new(&self.api, raw, HandleKind::RenderContext);
        *slot = Some(context);
        Ok(raw)
    }

    fn publisher(&mut self, provider: &str) -> Result<RawHandle> {
        if let Some(metadata) = self.publishers.get(provider) {
            return Ok(metadata.raw());
        }

        debug!("Opening publisher metadata for `{}`", provider);
        let raw = self
            .api
            .open_publisher_metadata(provider)
            .map_err(|status| {
                EvtError::native(self.api.as_ref(), "EvtOpenPublisherMetadata", status)
            })?;
        self.publishers.insert(
            provider.to_string(),
            EvtHandle::new(&self.api, raw, HandleKind::PublisherMetadata),
        );
        Ok(raw)
    }
}
