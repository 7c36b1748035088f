//! XML metadata sidecar.
//!
//! The sidecar describes everything needed to interpret the blob without
//! scanning it: format version, dataset name, identity, geometry, the
//! pixel table, the channel directory and the normalization directory.
//! It is always rewritten in full on finalize, never patched. Scalar
//! values are key/value `<param>` entries grouped by section; the dense
//! tables are attribute rows addressed by id, tolerated in any order
//! within their list.

use std::io::{BufRead, Write};

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::geometry::{Geometry, Pixel, PixelTable};
use crate::layout::{ChannelEntry, DatasetIdentity};

/// Everything the sidecar records about a container.
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarDoc {
    /// Container format version.
    pub format_version: u32,
    /// Dataset name.
    pub name: String,
    /// Source and container UUIDs.
    pub identity: DatasetIdentity,
    /// Declared number of mass channels N.
    pub channel_count: usize,
    /// Raster geometry.
    pub geometry: Geometry,
    /// Pixel table (corrected and motor coordinates).
    pub pixels: PixelTable,
    /// Channel directory (offset + length per channel id).
    pub directory: Vec<ChannelEntry>,
    /// Normalization directory: name + blob offset per vector.
    pub normalizations: Vec<(String, u64)>,
}

fn param<W: Write>(writer: &mut Writer<W>, name: &str, value: &str) -> Result<()> {
    let mut element = BytesStart::new("param");
    element.push_attribute(("name", name));
    element.push_attribute(("value", value));
    writer.write_event(Event::Empty(element))?;
    Ok(())
}

fn start<W: Write>(writer: &mut Writer<W>, element: BytesStart<'_>) -> Result<()> {
    writer.write_event(Event::Start(element))?;
    Ok(())
}

fn end<W: Write>(writer: &mut Writer<W>, name: &str) -> Result<()> {
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// Serialize `doc` as a complete sidecar XML document.
pub fn write_sidecar<W: Write>(out: W, doc: &SidecarDoc) -> Result<()> {
    let mut writer = Writer::new_with_indent(out, b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut root = BytesStart::new("msiContainer");
    root.push_attribute(("version", doc.format_version.to_string().as_str()));
    root.push_attribute(("name", doc.name.as_str()));
    start(&mut writer, root)?;

    start(&mut writer, BytesStart::new("fileContent"))?;
    param(&mut writer, "source uuid", &doc.identity.source_uuid.simple().to_string())?;
    param(
        &mut writer,
        "container uuid",
        &doc.identity.container_uuid.simple().to_string(),
    )?;
    end(&mut writer, "fileContent")?;

    start(&mut writer, BytesStart::new("scanSettings"))?;
    param(&mut writer, "mass channels", &doc.channel_count.to_string())?;
    param(&mut writer, "pixels x", &doc.geometry.width.to_string())?;
    param(&mut writer, "pixels y", &doc.geometry.height.to_string())?;
    param(&mut writer, "pixel size um", &doc.geometry.pixel_size_um.to_string())?;
    end(&mut writer, "scanSettings")?;

    start(&mut writer, BytesStart::new("run"))?;

    let mut list = BytesStart::new("pixelList");
    list.push_attribute(("count", doc.pixels.len().to_string().as_str()));
    start(&mut writer, list)?;
    for (id, pixel) in doc.pixels.iter() {
        let mut row = BytesStart::new("pixel");
        row.push_attribute(("id", id.to_string().as_str()));
        row.push_attribute(("x", pixel.x.to_string().as_str()));
        row.push_attribute(("y", pixel.y.to_string().as_str()));
        row.push_attribute(("motorX", pixel.motor_x.to_string().as_str()));
        row.push_attribute(("motorY", pixel.motor_y.to_string().as_str()));
        writer.write_event(Event::Empty(row))?;
    }
    end(&mut writer, "pixelList")?;

    let mut list = BytesStart::new("channelList");
    list.push_attribute(("count", doc.directory.len().to_string().as_str()));
    start(&mut writer, list)?;
    for (id, entry) in doc.directory.iter().enumerate() {
        let mut row = BytesStart::new("channel");
        row.push_attribute(("id", id.to_string().as_str()));
        row.push_attribute(("offset", entry.offset.to_string().as_str()));
        row.push_attribute(("length", entry.length.to_string().as_str()));
        writer.write_event(Event::Empty(row))?;
    }
    end(&mut writer, "channelList")?;

    let mut list = BytesStart::new("normalizationList");
    list.push_attribute(("count", doc.normalizations.len().to_string().as_str()));
    start(&mut writer, list)?;
    for (id, (name, offset)) in doc.normalizations.iter().enumerate() {
        let mut row = BytesStart::new("normalization");
        row.push_attribute(("id", id.to_string().as_str()));
        row.push_attribute(("name", name.as_str()));
        row.push_attribute(("offset", offset.to_string().as_str()));
        writer.write_event(Event::Empty(row))?;
    }
    end(&mut writer, "normalizationList")?;

    end(&mut writer, "run")?;
    end(&mut writer, "msiContainer")?;
    Ok(())
}

#[derive(Default)]
struct PartialDoc {
    saw_root: bool,
    format_version: Option<u32>,
    name: Option<String>,
    source_uuid: Option<Uuid>,
    container_uuid: Option<Uuid>,
    channel_count: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_size_um: Option<f64>,
    saw_file_content: bool,
    saw_scan_settings: bool,
    pixel_slots: Option<Vec<Option<Pixel>>>,
    channel_slots: Option<Vec<Option<ChannelEntry>>>,
    normalization_slots: Option<Vec<Option<(String, u64)>>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Section {
    None,
    FileContent,
    ScanSettings,
    Other,
}

struct Attrs {
    pairs: Vec<(Vec<u8>, String)>,
}

impl Attrs {
    fn collect(element: &BytesStart<'_>) -> Result<Self> {
        let mut pairs = Vec::new();
        for attr in element.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let value = attr.unescape_value()?.into_owned();
            pairs.push((attr.key.as_ref().to_vec(), value));
        }
        Ok(Self { pairs })
    }

    fn get(&self, key: &[u8]) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, key: &[u8], element: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| {
            Error::FormatMismatch(format!(
                "<{}> is missing the '{}' attribute",
                element,
                String::from_utf8_lossy(key)
            ))
        })
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::FormatMismatch(format!("invalid {what}: '{value}'")))
}

fn parse_uuid(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| Error::FormatMismatch(format!("invalid {what}: '{value}'")))
}

fn make_slots<T: Clone>(count: usize) -> Vec<Option<T>> {
    vec![None; count]
}

fn fill_slot<T>(
    slots: &mut Option<Vec<Option<T>>>,
    id: usize,
    value: T,
    element: &str,
) -> Result<()> {
    let slots = slots
        .as_mut()
        .ok_or_else(|| Error::FormatMismatch(format!("<{element}> outside of its list")))?;
    let slot = slots.get_mut(id).ok_or_else(|| {
        Error::FormatMismatch(format!("<{element}> id {id} is outside the declared count"))
    })?;
    if slot.is_some() {
        return Err(Error::FormatMismatch(format!("duplicate <{element}> id {id}")));
    }
    *slot = Some(value);
    Ok(())
}

fn drain_slots<T>(slots: Option<Vec<Option<T>>>, element: &str) -> Result<Vec<T>> {
    let slots =
        slots.ok_or_else(|| Error::FormatMismatch(format!("no <{element}> section found")))?;
    let mut out = Vec::with_capacity(slots.len());
    for (id, slot) in slots.into_iter().enumerate() {
        out.push(slot.ok_or_else(|| {
            Error::FormatMismatch(format!("<{element}> is missing the row with id {id}"))
        })?);
    }
    Ok(out)
}

fn handle_element(
    partial: &mut PartialDoc,
    section: Section,
    name: &[u8],
    attrs: &Attrs,
) -> Result<()> {
    match name {
        b"msiContainer" => {
            partial.saw_root = true;
            partial.format_version =
                Some(parse_number(attrs.require(b"version", "msiContainer")?, "format version")?);
            partial.name = Some(attrs.require(b"name", "msiContainer")?.to_string());
        }
        b"fileContent" => partial.saw_file_content = true,
        b"scanSettings" => partial.saw_scan_settings = true,
        b"param" => {
            let key = attrs.require(b"name", "param")?;
            let value = attrs.require(b"value", "param")?;
            match (section, key) {
                (Section::FileContent, "source uuid") => {
                    partial.source_uuid = Some(parse_uuid(value, "source uuid")?);
                }
                (Section::FileContent, "container uuid") => {
                    partial.container_uuid = Some(parse_uuid(value, "container uuid")?);
                }
                (Section::ScanSettings, "mass channels") => {
                    partial.channel_count = Some(parse_number(value, "mass channel count")?);
                }
                (Section::ScanSettings, "pixels x") => {
                    partial.width = Some(parse_number(value, "pixels x")?);
                }
                (Section::ScanSettings, "pixels y") => {
                    partial.height = Some(parse_number(value, "pixels y")?);
                }
                (Section::ScanSettings, "pixel size um") => {
                    partial.pixel_size_um = Some(parse_number(value, "pixel size")?);
                }
                // Unknown parameters are ignored for forward compatibility.
                _ => {}
            }
        }
        b"pixelList" => {
            let count = parse_number(attrs.require(b"count", "pixelList")?, "pixel count")?;
            partial.pixel_slots = Some(make_slots(count));
        }
        b"pixel" => {
            let id = parse_number(attrs.require(b"id", "pixel")?, "pixel id")?;
            let pixel = Pixel {
                x: parse_number(attrs.require(b"x", "pixel")?, "pixel x")?,
                y: parse_number(attrs.require(b"y", "pixel")?, "pixel y")?,
                motor_x: parse_number(attrs.require(b"motorX", "pixel")?, "motor x")?,
                motor_y: parse_number(attrs.require(b"motorY", "pixel")?, "motor y")?,
            };
            fill_slot(&mut partial.pixel_slots, id, pixel, "pixel")?;
        }
        b"channelList" => {
            let count = parse_number(attrs.require(b"count", "channelList")?, "channel count")?;
            partial.channel_slots = Some(make_slots(count));
        }
        b"channel" => {
            let id = parse_number(attrs.require(b"id", "channel")?, "channel id")?;
            let entry = ChannelEntry {
                offset: parse_number(attrs.require(b"offset", "channel")?, "channel offset")?,
                length: parse_number(attrs.require(b"length", "channel")?, "channel length")?,
            };
            fill_slot(&mut partial.channel_slots, id, entry, "channel")?;
        }
        b"normalizationList" => {
            let count =
                parse_number(attrs.require(b"count", "normalizationList")?, "normalization count")?;
            partial.normalization_slots = Some(make_slots(count));
        }
        b"normalization" => {
            let id = parse_number(attrs.require(b"id", "normalization")?, "normalization id")?;
            let name = attrs.require(b"name", "normalization")?.to_string();
            let offset =
                parse_number(attrs.require(b"offset", "normalization")?, "normalization offset")?;
            fill_slot(&mut partial.normalization_slots, id, (name, offset), "normalization")?;
        }
        // Unknown elements are skipped for forward compatibility.
        _ => {}
    }
    Ok(())
}

/// Parse a sidecar document, rejecting missing sections, out-of-range or
/// duplicate row ids, and count attributes that disagree with the actual
/// rows.
pub fn read_sidecar<R: BufRead>(input: R) -> Result<SidecarDoc> {
    let mut reader = Reader::from_reader(input);
    reader.config_mut().trim_text(true);

    let mut partial = PartialDoc::default();
    let mut sections: Vec<Section> = vec![Section::None];
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(element) => {
                let attrs = Attrs::collect(&element)?;
                let current = *sections.last().unwrap_or(&Section::None);
                handle_element(&mut partial, current, element.name().as_ref(), &attrs)?;
                sections.push(match element.name().as_ref() {
                    b"fileContent" => Section::FileContent,
                    b"scanSettings" => Section::ScanSettings,
                    _ => Section::Other,
                });
            }
            Event::Empty(element) => {
                let attrs = Attrs::collect(&element)?;
                let current = *sections.last().unwrap_or(&Section::None);
                handle_element(&mut partial, current, element.name().as_ref(), &attrs)?;
            }
            Event::End(_) => {
                sections.pop();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !partial.saw_root {
        return Err(Error::FormatMismatch("no msiContainer node found".to_string()));
    }
    if !partial.saw_file_content {
        return Err(Error::FormatMismatch("no fileContent section found".to_string()));
    }
    if !partial.saw_scan_settings {
        return Err(Error::FormatMismatch("no scanSettings section found".to_string()));
    }

    let missing = |what: &str| Error::FormatMismatch(format!("sidecar is missing {what}"));
    Ok(SidecarDoc {
        format_version: partial.format_version.ok_or_else(|| missing("the format version"))?,
        name: partial.name.ok_or_else(|| missing("the dataset name"))?,
        identity: DatasetIdentity {
            source_uuid: partial.source_uuid.ok_or_else(|| missing("the source uuid"))?,
            container_uuid: partial
                .container_uuid
                .ok_or_else(|| missing("the container uuid"))?,
        },
        channel_count: partial.channel_count.ok_or_else(|| missing("the mass channel count"))?,
        geometry: Geometry {
            width: partial.width.ok_or_else(|| missing("pixels x"))?,
            height: partial.height.ok_or_else(|| missing("pixels y"))?,
            pixel_size_um: partial.pixel_size_um.ok_or_else(|| missing("the pixel size"))?,
        },
        pixels: PixelTable::new(drain_slots(partial.pixel_slots, "pixelList")?),
        directory: drain_slots(partial.channel_slots, "channelList")?,
        normalizations: drain_slots(partial.normalization_slots, "normalizationList")?,
    })
}
