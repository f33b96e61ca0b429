use std::io::{Cursor, Error, ErrorKind, Read, Result};

use byteorder::{LittleEndian, ReadBytesExt};
use serde::{Deserialize, Serialize};

use crate::logservice::{log_debug, log_error};
use crate::upkobjects::deserialize_export;
use crate::upkreader::{
    NameIndex, UpkPackage, format_hex, format_hex8, format_hex_bytes, format_hex_float,
    format_hex_guid, format_hex_name, read_name_index,
};

const SENDER: &str = "DefaultProperty";

/// Structured value of one default property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PropertyValue {
    None,
    Byte(u8),
    Int(i32),
    Bool(bool),
    Float(f32),
    Object(i32),
    Name(NameIndex),
    String(String),
    Array(Vec<PropertyValue>),
    Struct(Vec<(String, PropertyValue)>),
    Raw(Vec<u8>),
}

/// One tag record of a default-property list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultProperty {
    pub name_idx: NameIndex,
    pub name: String,
    pub type_idx: Option<NameIndex>,
    /// Effective type: the inner struct name for struct records, and
    /// `NameProperty` for the 8-byte byte-property quirk.
    pub type_name: String,
    pub size: u32,
    pub array_idx: u32,
    pub bool_value: Option<u8>,
    pub inner_name_idx: Option<NameIndex>,
    pub value: PropertyValue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultPropertiesList {
    pub properties: Vec<DefaultProperty>,
    pub list_offset: u64,
    pub list_size: u32,
}

fn list_value(list: DefaultPropertiesList) -> PropertyValue {
    PropertyValue::Struct(
        list.properties
            .into_iter()
            .filter(|property| property.name != "None")
            .map(|property| (property.name, property.value))
            .collect(),
    )
}

/// Walks default-property lists of one export. The walker borrows the
/// package for name and schema resolution only; the cursor it reads from
/// belongs to the object deserializer.
pub struct PropertyWalker<'a> {
    pub pkg: &'a UpkPackage,
    pub export_idx: u32,
    pub try_unsafe: bool,
    pub quick: bool,
}

impl PropertyWalker<'_> {
    fn serial_size(&self) -> u32 {
        self.pkg.get_export_entry(self.export_idx).serial_size
    }

    /// Reads records until one resolves to the sentinel `"None"` or the
    /// buffer runs out.
    pub fn read_list(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        text: &mut String,
    ) -> Result<DefaultPropertiesList> {
        text.push_str("UDefaultPropertiesList:\n");
        let list_offset = cur.position();
        let mut properties = Vec::new();
        loop {
            let property = match self.read_property(cur, text) {
                Ok(property) => property,
                Err(err) => {
                    log_error(
                        &format!(
                            "Failed to deserialize property\n\tProperty owner: {}",
                            self.pkg.get_entry_full_name(self.export_idx as i32)
                        ),
                        SENDER,
                    );
                    text.push_str("Error deserializing property!\n");
                    return Err(err);
                }
            };
            log_debug(&format!("Deserialized property {}", property.name), SENDER);
            let done = property.name == "None";
            properties.push(property);
            if done || cur.position() >= cur.get_ref().len() as u64 {
                break;
            }
        }
        Ok(DefaultPropertiesList {
            properties,
            list_offset,
            list_size: (cur.position() - list_offset) as u32,
        })
    }

    fn read_property(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        text: &mut String,
    ) -> Result<DefaultProperty> {
        text.push_str("UDefaultProperty:\n");
        let name_idx = read_name_index(cur)?;
        let name = self.pkg.index_to_name(name_idx);
        text.push_str(&format!("\tNameIdx: {} -> {}\n", format_hex_name(name_idx), name));
        if name == "None" {
            return Ok(DefaultProperty {
                name_idx,
                name,
                type_idx: None,
                type_name: "None".into(),
                size: 0,
                array_idx: 0,
                bool_value: None,
                inner_name_idx: None,
                value: PropertyValue::None,
            });
        }
        let type_idx = read_name_index(cur)?;
        let mut type_name = self.pkg.index_to_name(type_idx);
        text.push_str(&format!("\tTypeIdx: {} -> {}\n", format_hex_name(type_idx), type_name));
        let size = cur.read_u32::<LittleEndian>()?;
        text.push_str(&format!("\tPropertySize: {}\n", format_hex(size)));
        if size > self.serial_size() {
            log_error("Bad PropertySize!", SENDER);
            return Err(Error::new(ErrorKind::InvalidData, "bad PropertySize"));
        }
        let array_idx = cur.read_u32::<LittleEndian>()?;
        text.push_str(&format!("\tArrayIdx: {}\n", format_hex(array_idx)));
        let mut bool_value = None;
        let mut value = PropertyValue::None;
        if type_name == "BoolProperty" {
            // The inline tag value is a single byte.
            let byte = cur.read_u8()?;
            text.push_str(&format!(
                "\tBoolean value: {} = {}\n",
                format_hex8(byte),
                if byte == 0 { "false" } else { "true" }
            ));
            bool_value = Some(byte);
            value = PropertyValue::Bool(byte != 0);
        }
        let mut inner_name_idx = None;
        if type_name == "StructProperty" || type_name == "ByteProperty" {
            let inner = read_name_index(cur)?;
            text.push_str(&format!(
                "\tInnerNameIdx: {} -> {}\n",
                format_hex_name(inner),
                self.pkg.index_to_name(inner)
            ));
            inner_name_idx = Some(inner);
            if type_name == "StructProperty" {
                type_name = self.pkg.index_to_name(inner);
            }
            if type_name == "ByteProperty" && size == 8 {
                type_name = "NameProperty".into();
            }
        }
        if size > 0 {
            let offset = cur.position();
            if self.quick {
                log_debug("Quick mode: skipping default property deserialization.", SENDER);
                text.push_str("Quick mode: skipping value.\n");
            } else {
                value = self.read_value(cur, text, &name, &type_name, size)?;
            }
            // Skip the declared size regardless of what the body consumed,
            // so a short read cannot desynchronize the list.
            cur.set_position(offset + size as u64);
        }
        Ok(DefaultProperty {
            name_idx,
            name,
            type_idx: Some(type_idx),
            type_name,
            size,
            array_idx,
            bool_value,
            inner_name_idx,
            value,
        })
    }

    fn read_value(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        text: &mut String,
        name: &str,
        type_name: &str,
        size: u32,
    ) -> Result<PropertyValue> {
        match type_name {
            "ArrayProperty" => self.read_array_value(cur, text, name, size),
            "BoolProperty" => {
                let byte = cur.read_u8()?;
                text.push_str(&format!(
                    "\tBoolean value: {} = {}\n",
                    format_hex8(byte),
                    if byte == 0 { "false" } else { "true" }
                ));
                Ok(PropertyValue::Bool(byte != 0))
            }
            "ByteProperty" => {
                let byte = cur.read_u8()?;
                text.push_str(&format!("\tByte value: {} = {}\n", format_hex8(byte), byte));
                Ok(PropertyValue::Byte(byte))
            }
            "IntProperty" => {
                let value = cur.read_i32::<LittleEndian>()?;
                text.push_str(&format!("\tInteger: {} = {}\n", format_hex(value as u32), value));
                Ok(PropertyValue::Int(value))
            }
            "FloatProperty" => {
                let value = cur.read_f32::<LittleEndian>()?;
                text.push_str(&format!("\tFloat: {} = {}\n", format_hex_float(value), value));
                Ok(PropertyValue::Float(value))
            }
            "ObjectProperty" | "InterfaceProperty" | "ComponentProperty" | "ClassProperty" => {
                let value = cur.read_i32::<LittleEndian>()?;
                if value == 0 {
                    text.push_str(&format!("\tObject: {} = none\n", format_hex(0)));
                } else {
                    text.push_str(&format!(
                        "\tObject: {} = {}\n",
                        format_hex(value as u32),
                        self.pkg.objref_to_name(value)
                    ));
                }
                Ok(PropertyValue::Object(value))
            }
            "DelegateProperty" => {
                let objref = cur.read_i32::<LittleEndian>()?;
                text.push_str(&format!(
                    "\tReturn Value (?): {} = {}\n",
                    format_hex(objref as u32),
                    self.pkg.objref_to_name(objref)
                ));
                let delegate = read_name_index(cur)?;
                text.push_str(&format!(
                    "\tDelegate Name: {} = {}\n",
                    format_hex_name(delegate),
                    self.pkg.index_to_name(delegate)
                ));
                Ok(PropertyValue::Struct(vec![
                    ("Object".into(), PropertyValue::Object(objref)),
                    ("Delegate".into(), PropertyValue::Name(delegate)),
                ]))
            }
            "NameProperty" => {
                let value = read_name_index(cur)?;
                text.push_str(&format!(
                    "\tName: {} = {}\n",
                    format_hex_name(value),
                    self.pkg.index_to_name(value)
                ));
                Ok(PropertyValue::Name(value))
            }
            "StrProperty" => {
                let str_length = cur.read_i32::<LittleEndian>()?;
                text.push_str(&format!(
                    "\tStrLength = {} = {}\n",
                    format_hex(str_length as u32),
                    str_length
                ));
                if str_length > 0 {
                    let mut bytes = vec![0u8; str_length as usize];
                    cur.read_exact(&mut bytes)?;
                    if bytes.last() == Some(&0) {
                        bytes.pop();
                    }
                    let value: String = bytes.iter().map(|&b| b as char).collect();
                    text.push_str(&format!("\tString = {value}\n"));
                    Ok(PropertyValue::String(value))
                } else if str_length < 0 {
                    let mut units = vec![0u16; (-str_length) as usize];
                    for unit in units.iter_mut() {
                        *unit = cur.read_u16::<LittleEndian>()?;
                    }
                    if units.last() == Some(&0) {
                        units.pop();
                    }
                    let value = String::from_utf16_lossy(&units);
                    text.push_str(&format!("\tUnicode String = {value}\n"));
                    Ok(PropertyValue::String(value))
                } else {
                    Ok(PropertyValue::String(String::new()))
                }
            }
            "Vector" => {
                let fields = self.read_float_struct(cur, text, "Vector", &["X", "Y", "Z"])?;
                Ok(PropertyValue::Struct(fields))
            }
            "Plane" => {
                let fields = self.read_float_struct(cur, text, "Plane", &["X", "Y", "Z", "W"])?;
                Ok(PropertyValue::Struct(fields))
            }
            "Rotator" => {
                let pitch = cur.read_i32::<LittleEndian>()?;
                let yaw = cur.read_i32::<LittleEndian>()?;
                let roll = cur.read_i32::<LittleEndian>()?;
                text.push_str(&format!(
                    "\tRotator (Pitch, Yaw, Roll) = ({}, {}, {}) = ({pitch}, {yaw}, {roll})\n",
                    format_hex(pitch as u32),
                    format_hex(yaw as u32),
                    format_hex(roll as u32)
                ));
                Ok(PropertyValue::Struct(vec![
                    ("Pitch".into(), PropertyValue::Int(pitch)),
                    ("Yaw".into(), PropertyValue::Int(yaw)),
                    ("Roll".into(), PropertyValue::Int(roll)),
                ]))
            }
            "Vector2D" => {
                let fields = self.read_float_struct(cur, text, "Vector2D", &["X", "Y"])?;
                Ok(PropertyValue::Struct(fields))
            }
            "Guid" => {
                let guid = crate::upkreader::read_guid(cur)?;
                text.push_str(&format!("\tGUID = {}\n", format_hex_guid(guid)));
                Ok(guid_value(guid))
            }
            "Color" => {
                let r = cur.read_u8()?;
                let g = cur.read_u8()?;
                let b = cur.read_u8()?;
                let a = cur.read_u8()?;
                text.push_str(&format!(
                    "\tColor (R, G, B, A) = ({}, {}, {}, {}) = ({r}, {g}, {b}, {a})\n",
                    format_hex8(r),
                    format_hex8(g),
                    format_hex8(b),
                    format_hex8(a)
                ));
                Ok(PropertyValue::Struct(vec![
                    ("R".into(), PropertyValue::Byte(r)),
                    ("G".into(), PropertyValue::Byte(g)),
                    ("B".into(), PropertyValue::Byte(b)),
                    ("A".into(), PropertyValue::Byte(a)),
                ]))
            }
            "LinearColor" => {
                let fields = self.read_float_struct(cur, text, "LinearColor", &["R", "G", "B", "A"])?;
                Ok(PropertyValue::Struct(fields))
            }
            "Box" => {
                let min = self.read_float_struct(cur, text, "Vector Min", &["X", "Y", "Z"])?;
                let max = self.read_float_struct(cur, text, "Vector Max", &["X", "Y", "Z"])?;
                let valid = cur.read_u8()?;
                text.push_str(&format!(
                    "\tIsValid: {} = {}\n",
                    format_hex8(valid),
                    if valid == 0 { "false" } else { "true" }
                ));
                Ok(PropertyValue::Struct(vec![
                    ("Min".into(), PropertyValue::Struct(min)),
                    ("Max".into(), PropertyValue::Struct(max)),
                    ("IsValid".into(), PropertyValue::Byte(valid)),
                ]))
            }
            "Matrix" => {
                let mut planes = Vec::with_capacity(4);
                for label in ["XPlane", "YPlane", "ZPlane", "WPlane"] {
                    let fields = self.read_float_struct(cur, text, label, &["X", "Y", "Z", "W"])?;
                    planes.push((label.to_string(), PropertyValue::Struct(fields)));
                }
                Ok(PropertyValue::Struct(planes))
            }
            "ScriptStruct" => {
                let list = self.read_list(cur, text)?;
                Ok(list_value(list))
            }
            _ => self.read_fallback_value(cur, text, name, size),
        }
    }

    fn read_float_struct(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        text: &mut String,
        label: &str,
        fields: &[&str],
    ) -> Result<Vec<(String, PropertyValue)>> {
        let mut values = Vec::with_capacity(fields.len());
        for field in fields {
            values.push((field.to_string(), cur.read_f32::<LittleEndian>()?));
        }
        let hex: Vec<String> = values.iter().map(|(_, v)| format_hex_float(*v)).collect();
        let dec: Vec<String> = values.iter().map(|(_, v)| v.to_string()).collect();
        text.push_str(&format!(
            "\t{label} ({}) = ({}) = ({})\n",
            fields.join(", "),
            hex.join(", "),
            dec.join(", ")
        ));
        Ok(values.into_iter().map(|(name, v)| (name.to_string(), PropertyValue::Float(v))).collect())
    }

    fn read_array_value(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        text: &mut String,
        name: &str,
        size: u32,
    ) -> Result<PropertyValue> {
        let num_elements = cur.read_u32::<LittleEndian>()?;
        text.push_str(&format!(
            "\tNumElements = {} = {}\n",
            format_hex(num_elements),
            num_elements
        ));
        if num_elements > size {
            log_error("Bad NumElements!", SENDER);
            return Err(Error::new(ErrorKind::InvalidData, "bad NumElements"));
        }
        if num_elements == 0 || size <= 4 {
            return Ok(PropertyValue::Array(Vec::new()));
        }
        let mut inner_type = self.find_array_type(name);
        text.push_str(&format!("\tArrayInnerType = {inner_type}\n"));
        if inner_type == "None" && self.try_unsafe {
            inner_type = Self::guess_array_type(name).to_string();
            if inner_type != "None" {
                text.push_str(&format!("\tUnsafe guess: ArrayInnerType = {inner_type}\n"));
            }
        }
        let inner_size = size - 4;
        let mut elements = Vec::new();
        if inner_type != "None" {
            let per_element = inner_size / num_elements;
            for i in 0..num_elements {
                text.push_str(&format!("\t{name}[{i}]:\n"));
                elements.push(self.read_value(cur, text, "ArrayProperty", &inner_type, per_element)?);
            }
        } else {
            let mut ends_with_none = false;
            if inner_size > 8 && self.try_unsafe {
                log_debug("Attempting to determine inner array type.", SENDER);
                let offset = cur.position() as usize;
                let buf = cur.get_ref();
                if offset + inner_size as usize <= buf.len() {
                    let tail = &buf[offset + inner_size as usize - 8..offset + inner_size as usize];
                    let tail_idx = NameIndex {
                        index: u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]),
                        numeric: u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]),
                    };
                    ends_with_none = self.pkg.is_none_idx(tail_idx);
                }
            }
            if ends_with_none && self.try_unsafe {
                log_debug("Unsafe guess: it's a Property List.", SENDER);
                for i in 0..num_elements {
                    text.push_str(&format!("\t{name}[{i}]:\n"));
                    text.push_str("Unsafe guess (it's a Property List):\n");
                    let list = self.read_list(cur, text)?;
                    elements.push(list_value(list));
                }
            } else if self.try_unsafe {
                log_debug("Unsafe guess: it's a uniform array.", SENDER);
                let per_element = inner_size / num_elements;
                for i in 0..num_elements {
                    text.push_str(&format!("\t{name}[{i}]:\n"));
                    elements.push(self.read_value(cur, text, "ArrayProperty", "None", per_element)?);
                }
            } else {
                log_debug("Unknown property type, deserializing as a single value.", SENDER);
                elements.push(self.read_value(cur, text, "ArrayProperty", "None", inner_size)?);
            }
        }
        Ok(PropertyValue::Array(elements))
    }

    fn read_fallback_value(
        &self,
        cur: &mut Cursor<Vec<u8>>,
        text: &mut String,
        name: &str,
        size: u32,
    ) -> Result<PropertyValue> {
        // Size-based guesses; never taken in strict mode. A big body is
        // probably a nested property list, unless this is already an array
        // element.
        if self.try_unsafe && name != "ArrayProperty" && size > 24 {
            log_debug("Unsafe guess: it's a Property List.", SENDER);
            text.push_str("Unsafe guess (it's a Property List):\n");
            let list = self.read_list(cur, text)?;
            return Ok(list_value(list));
        }
        if self.try_unsafe && size == 16 {
            log_debug("Unsafe guess: it's GUID.", SENDER);
            let guid = crate::upkreader::read_guid(cur)?;
            text.push_str(&format!("\tUnsafe guess: GUID = {}\n", format_hex_guid(guid)));
            return Ok(guid_value(guid));
        }
        if self.try_unsafe && size == 8 {
            log_debug("Unsafe guess: it's a NameIndex.", SENDER);
            let value = read_name_index(cur)?;
            text.push_str("\tUnsafe guess:\n");
            text.push_str(&format!(
                "\tName: {} = {}\n",
                format_hex_name(value),
                self.pkg.index_to_name(value)
            ));
            return Ok(PropertyValue::Name(value));
        }
        if self.try_unsafe && size == 4 {
            log_debug("Unsafe guess: it's an Integer or a Reference.", SENDER);
            let value = cur.read_i32::<LittleEndian>()?;
            text.push_str(&format!(
                "\tUnsafe guess: It's an Integer: {} = {} or a Reference: {} -> {}\n",
                format_hex(value as u32),
                value,
                format_hex(value as u32),
                self.pkg.objref_to_name(value)
            ));
            return Ok(PropertyValue::Int(value));
        }
        if self.try_unsafe && size == 1 {
            log_debug("Unsafe guess: it's a boolean.", SENDER);
            let byte = cur.read_u8()?;
            text.push_str(&format!(
                "\tUnsafe guess: It's a boolean: {} = {}\n",
                format_hex8(byte),
                if byte == 0 { "false" } else { "true" }
            ));
            return Ok(PropertyValue::Bool(byte != 0));
        }
        log_debug("Unknown property, skipping.", SENDER);
        if size <= self.serial_size() {
            let mut unknown = vec![0u8; size as usize];
            cur.read_exact(&mut unknown)?;
            text.push_str(&format!("\tUnknown property: {}\n", format_hex_bytes(&unknown)));
            return Ok(PropertyValue::Raw(unknown));
        }
        Ok(PropertyValue::Raw(Vec::new()))
    }

    /// Schema lookup: resolve the array's own property export and follow
    /// its inner reference to the element type.
    fn find_array_type(&self, name: &str) -> String {
        if self.export_idx == 0 {
            return "None".into();
        }
        let mut owner_name = self.pkg.get_entry_full_name(self.export_idx as i32);
        if let Some(stripped) = owner_name.strip_prefix("Default__") {
            owner_name = stripped.to_string();
        }
        let full_name = format!("{owner_name}.{name}");
        let mut objref = self.pkg.find_object(&full_name, true);
        if objref == 0 {
            let full_name =
                format!("{}.{}", self.pkg.get_entry_type(self.export_idx as i32), name);
            objref = self.pkg.find_object(&full_name, true);
        }
        if objref > 0
            && self.pkg.get_entry_type(objref) == "ArrayProperty"
            && let Ok(object) = deserialize_export(self.pkg, objref as u32, false, true)
        {
            let mut inner = object.inner_ref();
            if self.pkg.get_entry_type(inner) == "StructProperty"
                && inner > 0
                && let Ok(inner_object) = deserialize_export(self.pkg, inner as u32, false, true)
            {
                inner = inner_object.struct_obj_ref();
            }
            return self.pkg.get_entry_type(inner);
        }
        "None".into()
    }

    /// Well-known array names whose element type the schema cannot resolve.
    fn guess_array_type(name: &str) -> &'static str {
        match name {
            "VertexData" => "Vector",
            "PermutedVertexData" => "Plane",
            "FaceTriData" => "IntProperty",
            "EdgeDirections" => "Vector",
            "FaceNormalDirections" => "Vector",
            "FacePlaneData" => "Plane",
            "ElemBox" => "Box",
            _ => "None",
        }
    }
}

fn guid_value(guid: [u32; 4]) -> PropertyValue {
    PropertyValue::Struct(vec![
        ("A".into(), PropertyValue::Int(guid[0] as i32)),
        ("B".into(), PropertyValue::Int(guid[1] as i32)),
        ("C".into(), PropertyValue::Int(guid[2] as i32)),
        ("D".into(), PropertyValue::Int(guid[3] as i32)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpkg::{PropList, TestPackage};

    fn walker_fixture(
        package_name: &str,
        payload_builder: impl FnOnce(&TestPackage) -> Vec<u8>,
    ) -> (UpkPackage, u32) {
        let template = TestPackage::basic();
        let payload = payload_builder(&template);
        let pkg = template.with_payload("TestObj", payload).load(package_name);
        let idx = pkg.find_object_by_name("TestObj", true) as u32;
        (pkg, idx)
    }

    fn walk(pkg: &UpkPackage, idx: u32, try_unsafe: bool) -> (DefaultPropertiesList, u64) {
        let mut cur = Cursor::new(pkg.get_export_data(idx));
        // Skip the net index the fixture payload starts with.
        cur.set_position(4);
        let walker = PropertyWalker { pkg, export_idx: idx, try_unsafe, quick: false };
        let mut text = String::new();
        let list = walker.read_list(&mut cur, &mut text).unwrap();
        (list, cur.position())
    }

    #[test]
    fn lone_none_terminates_list() {
        let (pkg, idx) = walker_fixture("props_lone_none", |t| {
            let mut p = PropList::new(t);
            p.none();
            p.into_payload()
        });
        let (list, pos) = walk(&pkg, idx, false);
        assert_eq!(list.properties.len(), 1);
        assert_eq!(list.properties[0].name, "None");
        // Only the 8-byte name reference is consumed, no type follows.
        assert_eq!(pos, 4 + 8);
    }

    #[test]
    fn empty_string_property() {
        let (pkg, idx) = walker_fixture("props_empty_str", |t| {
            let mut p = PropList::new(t);
            p.record("Caption", "StrProperty", &0i32.to_le_bytes());
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, false);
        let prop = &list.properties[0];
        assert_eq!(prop.size, 4);
        match &prop.value {
            PropertyValue::String(s) => assert!(s.is_empty()),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn negative_length_unicode_string() {
        let (pkg, idx) = walker_fixture("props_unicode_str", |t| {
            let mut body = Vec::new();
            body.extend_from_slice(&(-3i32).to_le_bytes());
            body.extend_from_slice(&[0x48, 0x00, 0x65, 0x00, 0x6C, 0x00]);
            let mut p = PropList::new(t);
            p.record("Caption", "StrProperty", &body);
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, false);
        match &list.properties[0].value {
            PropertyValue::String(s) => assert_eq!(s, "Hel"),
            other => panic!("expected a string, got {other:?}"),
        }
    }

    #[test]
    fn bool_tag_value_is_one_byte() {
        let (pkg, idx) = walker_fixture("props_bool_tag", |t| {
            let mut p = PropList::new(t);
            p.bool_record("Enabled", 1);
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, false);
        let prop = &list.properties[0];
        assert_eq!(prop.bool_value, Some(1));
        assert!(matches!(prop.value, PropertyValue::Bool(true)));
    }

    #[test]
    fn byte_property_of_size_eight_reads_a_name() {
        let (pkg, idx) = walker_fixture("props_byte_quirk", |t| {
            let mut body = Vec::new();
            body.extend_from_slice(&t.name_ref("Core"));
            let mut p = PropList::new(t);
            p.byte_record("Kind", "Core", &body);
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, false);
        let prop = &list.properties[0];
        assert_eq!(prop.type_name, "NameProperty");
        match &prop.value {
            PropertyValue::Name(n) => assert_eq!(pkg.index_to_name(*n), "Core"),
            other => panic!("expected a name, got {other:?}"),
        }
    }

    #[test]
    fn oversized_property_is_malformed() {
        let (pkg, idx) = walker_fixture("props_oversized", |t| {
            let mut p = PropList::new(t);
            p.record_with_size("Huge", "IntProperty", 0x7FFF_0000, &4i32.to_le_bytes());
            p.none();
            p.into_payload()
        });
        let mut cur = Cursor::new(pkg.get_export_data(idx));
        cur.set_position(4);
        let walker = PropertyWalker { pkg: &pkg, export_idx: idx, try_unsafe: false, quick: false };
        let mut text = String::new();
        assert!(walker.read_list(&mut cur, &mut text).is_err());
    }

    #[test]
    fn vector_array_by_guess_table() {
        let (pkg, idx) = walker_fixture("props_vertex_array", |t| {
            let mut body = Vec::new();
            body.extend_from_slice(&3u32.to_le_bytes());
            for i in 0..9 {
                body.extend_from_slice(&(i as f32).to_le_bytes());
            }
            let mut p = PropList::new(t);
            p.record("VertexData", "ArrayProperty", &body);
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, true);
        let prop = &list.properties[0];
        assert_eq!(prop.size, 40);
        match &prop.value {
            PropertyValue::Array(elements) => {
                assert_eq!(elements.len(), 3);
                for element in elements {
                    match element {
                        PropertyValue::Struct(fields) => assert_eq!(fields.len(), 3),
                        other => panic!("expected a vector struct, got {other:?}"),
                    }
                }
            }
            other => panic!("expected an array, got {other:?}"),
        }
    }

    #[test]
    fn body_seek_guard_recovers_short_reads() {
        let (pkg, idx) = walker_fixture("props_seek_guard", |t| {
            // IntProperty body declared 8 bytes wide; the reader consumes 4.
            let mut body = Vec::new();
            body.extend_from_slice(&7i32.to_le_bytes());
            body.extend_from_slice(&[0xEE; 4]);
            let mut p = PropList::new(t);
            p.record("Padded", "IntProperty", &body);
            p.int_record("After", 5);
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, false);
        assert_eq!(list.properties.len(), 3);
        assert!(matches!(list.properties[0].value, PropertyValue::Int(7)));
        assert_eq!(list.properties[1].name, "After");
        assert!(matches!(list.properties[1].value, PropertyValue::Int(5)));
    }

    #[test]
    fn strict_mode_never_guesses() {
        let (pkg, idx) = walker_fixture("props_strict", |t| {
            let mut p = PropList::new(t);
            // A type the walker has no rule for, 4 bytes of body.
            p.record("Odd", "Core", &[1, 2, 3, 4]);
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, false);
        match &list.properties[0].value {
            PropertyValue::Raw(raw) => assert_eq!(raw, &[1, 2, 3, 4]),
            other => panic!("expected raw bytes, got {other:?}"),
        }
    }

    #[test]
    fn unsafe_four_byte_guess_is_an_int() {
        let (pkg, idx) = walker_fixture("props_unsafe_int", |t| {
            let mut p = PropList::new(t);
            p.record("Odd", "Core", &9i32.to_le_bytes());
            p.none();
            p.into_payload()
        });
        let (list, _) = walk(&pkg, idx, true);
        assert!(matches!(list.properties[0].value, PropertyValue::Int(9)));
    }

    #[test]
    fn array_inner_type_from_schema() {
        let mut body = Vec::new();
        body.extend_from_slice(&3u32.to_le_bytes());
        for v in [10i32, 20, 30] {
            body.extend_from_slice(&v.to_le_bytes());
        }
        let template = TestPackage::with_array_schema();
        let payload = {
            let mut p = PropList::new(&template);
            p.record("Nums", "ArrayProperty", &body);
            p.none();
            p.into_payload()
        };
        let pkg = template.with_payload("TestObj", payload).load("props_schema_array");
        let idx = pkg.find_object_by_name("TestObj", true) as u32;
        let (list, _) = walk(&pkg, idx, false);
        match &list.properties[0].value {
            PropertyValue::Array(elements) => {
                assert_eq!(elements.len(), 3);
                assert!(matches!(elements[0], PropertyValue::Int(10)));
                assert!(matches!(elements[2], PropertyValue::Int(30)));
            }
            other => panic!("expected an array, got {other:?}"),
        }
    }
}
