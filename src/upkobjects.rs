use std::io::{Cursor, Error, ErrorKind, Read, Result};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::logservice::log_debug;
use crate::upkprops::{DefaultPropertiesList, PropertyWalker};
use crate::upkreader::{
    NameIndex, ObjectFlagsH, ObjectFlagsL, UpkPackage, flag_lines, format_hex, format_hex8,
    format_hex16, format_hex_bytes, format_hex_name, read_cstring, read_name_index,
};

const SENDER: &str = "UpkObject";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u32 {
        const Final = 0x00000001;
        const Defined = 0x00000002;
        const Iterator = 0x00000004;
        const Latent = 0x00000008;
        const PreOperator = 0x00000010;
        const Singular = 0x00000020;
        const Net = 0x00000040;
        const NetReliable = 0x00000080;
        const Simulated = 0x00000100;
        const Exec = 0x00000200;
        const Native = 0x00000400;
        const Event = 0x00000800;
        const Operator = 0x00001000;
        const Static = 0x00002000;
        const HasOptionalParms = 0x00004000;
        const Const = 0x00008000;
        const Public = 0x00020000;
        const Private = 0x00040000;
        const Protected = 0x00080000;
        const Delegate = 0x00100000;
        const NetServer = 0x00200000;
        const HasOutParms = 0x00400000;
        const HasDefaults = 0x00800000;
        const NetClient = 0x01000000;
        const DLLImport = 0x02000000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlagsL: u32 {
        const Editable = 0x00000001;
        const Const = 0x00000002;
        const Input = 0x00000004;
        const ExportObject = 0x00000008;
        const OptionalParm = 0x00000010;
        const Net = 0x00000020;
        const EditFixedSize = 0x00000040;
        const Parm = 0x00000080;
        const OutParm = 0x00000100;
        const SkipParm = 0x00000200;
        const ReturnParm = 0x00000400;
        const CoerceParm = 0x00000800;
        const Native = 0x00001000;
        const Transient = 0x00002000;
        const Config = 0x00004000;
        const Localized = 0x00008000;
        const EditConst = 0x00020000;
        const GlobalConfig = 0x00040000;
        const Component = 0x00080000;
        const AlwaysInit = 0x00100000;
        const DuplicateTransient = 0x00200000;
        const NeedCtorLink = 0x00400000;
        const NoExport = 0x00800000;
        const NoImport = 0x01000000;
        const NoClear = 0x02000000;
        const EditInline = 0x04000000;
        const EditInlineUse = 0x10000000;
        const Deprecated = 0x20000000;
        const DataBinding = 0x40000000;
        const SerializeText = 0x80000000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropertyFlagsH: u32 {
        const RepNotify = 0x00000001;
        const Interp = 0x00000002;
        const NonTransactional = 0x00000004;
        const EditorOnly = 0x00000008;
        const NotForConsole = 0x00000010;
        const RepRetry = 0x00000020;
        const PrivateWrite = 0x00000040;
        const ProtectedWrite = 0x00000080;
        const ArchetypeProperty = 0x00000100;
        const EditHide = 0x00000200;
        const EditTextBox = 0x00000400;
        const CrossLevelPassive = 0x00001000;
        const CrossLevelActive = 0x00002000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StructFlags: u32 {
        const Native = 0x00000001;
        const Export = 0x00000002;
        const HasComponents = 0x00000004;
        const Transient = 0x00000008;
        const Atomic = 0x00000010;
        const Immutable = 0x00000020;
        const StrictConfig = 0x00000040;
        const ImmutableWhenCooked = 0x00000080;
        const AtomicWhenCooked = 0x00000100;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const Editable = 0x00000001;
        const Auto = 0x00000002;
        const Simulated = 0x00000004;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClassFlags: u32 {
        const Abstract = 0x00000001;
        const Compiled = 0x00000002;
        const Config = 0x00000004;
        const Transient = 0x00000008;
        const Parsed = 0x00000010;
        const Localized = 0x00000020;
        const SafeReplace = 0x00000040;
        const Native = 0x00000080;
        const NoExport = 0x00000100;
        const Placeable = 0x00000200;
        const PerObjectConfig = 0x00000400;
        const NativeReplication = 0x00000800;
        const EditInlineNew = 0x00001000;
        const CollapseCategories = 0x00002000;
        const Interface = 0x00004000;
        const HasInstancedProps = 0x00200000;
        const NeedsDefProps = 0x00400000;
        const HasComponents = 0x00800000;
        const Hidden = 0x01000000;
        const Deprecated = 0x02000000;
        const HideDropDown = 0x04000000;
        const Exported = 0x08000000;
        const Intrinsic = 0x10000000;
        const NativeOnly = 0x20000000;
    }
}

/// Serialized wrapper for a raw byte payload used when writing bulk blocks.
#[derive(Debug, Clone, Default)]
pub struct BulkDataMirror {
    pub saved_flags: u32,
    pub element_count: u32,
    pub size_on_disk: u32,
    pub offset_in_file: u32,
    pub data: Vec<u8>,
}

impl BulkDataMirror {
    pub fn from_data(data: Vec<u8>) -> BulkDataMirror {
        BulkDataMirror {
            saved_flags: 0,
            element_count: data.len() as u32,
            size_on_disk: data.len() as u32,
            offset_in_file: 0,
            data,
        }
    }

    pub fn set_file_offset(&mut self, offset: u32) {
        self.offset_in_file = offset;
    }

    /// Size of the mirror header preceding the payload.
    pub fn rel_offset() -> u32 {
        16
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.data.len());
        let write: Result<()> = (|| {
            out.write_u32::<LittleEndian>(self.saved_flags)?;
            out.write_u32::<LittleEndian>(self.element_count)?;
            out.write_u32::<LittleEndian>(self.size_on_disk)?;
            out.write_u32::<LittleEndian>(self.offset_in_file)?;
            Ok(())
        })();
        write.unwrap_or_else(|_| unreachable!("in-memory write"));
        out.extend_from_slice(&self.data);
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldData {
    pub next_ref: i32,
    /// Structure variants only.
    pub parent_ref: i32,
    pub next_ref_offset: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StructData {
    pub field: FieldData,
    pub script_text_ref: i32,
    pub first_child_ref: i32,
    pub first_child_ref_offset: u64,
    pub cpp_text_ref: i32,
    pub line: u32,
    pub text_pos: u32,
    pub script_memory_size: u32,
    pub script_serial_size: u32,
    pub script_offset: u64,
    pub bytecode: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionData {
    pub strukt: StructData,
    pub native_token: u16,
    pub oper_precedence: u8,
    pub function_flags: u32,
    pub rep_offset: Option<u16>,
    pub name_idx: NameIndex,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptStructData {
    pub strukt: StructData,
    pub struct_flags: u32,
    pub defaults: DefaultPropertiesList,
}

#[derive(Debug, Clone, Default)]
pub struct StateData {
    pub strukt: StructData,
    pub probe_mask: u32,
    pub label_table_offset: u16,
    pub state_flags: u32,
    pub state_map: Vec<(NameIndex, i32)>,
}

#[derive(Debug, Clone, Default)]
pub struct ClassData {
    pub state: StateData,
    pub class_flags: u32,
    pub within_ref: i32,
    pub config_name_idx: NameIndex,
    pub components: Vec<(NameIndex, i32)>,
    pub interfaces: Vec<(i32, u32)>,
    pub dont_sort_categories: Vec<NameIndex>,
    pub hide_categories: Vec<NameIndex>,
    pub auto_expand_categories: Vec<NameIndex>,
    pub auto_collapse_categories: Vec<NameIndex>,
    pub force_script_order: u32,
    pub class_groups: Vec<NameIndex>,
    pub native_class_name: String,
    pub dll_bind_name: NameIndex,
    pub default_ref: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ConstData {
    pub field: FieldData,
    pub value_length: u32,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct EnumData {
    pub field: FieldData,
    pub names: Vec<NameIndex>,
}

#[derive(Debug, Clone, Default)]
pub struct PropertyData {
    pub field: FieldData,
    pub array_dim: u16,
    pub element_size: u16,
    pub flags_l: u32,
    pub flags_h: u32,
    pub category_idx: NameIndex,
    pub array_enum_ref: i32,
    pub rep_offset: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct LevelData {
    pub level_ref: i32,
    pub world_info_ref: i32,
    pub actors: Vec<i32>,
}

#[derive(Debug, Clone)]
pub enum ObjectBody {
    /// Sentinel null object.
    None,
    /// Bare object: net index and default properties only.
    Object,
    Unknown,
    Level(LevelData),
    Const(ConstData),
    Enum(EnumData),
    Struct(StructData),
    ScriptStruct(ScriptStructData),
    Function(FunctionData),
    State(StateData),
    Class(Box<ClassData>),
    Property(PropertyData),
    ByteProperty { prop: PropertyData, enum_ref: i32 },
    ObjectProperty { prop: PropertyData, other_ref: i32 },
    ClassProperty { prop: PropertyData, other_ref: i32, class_ref: i32 },
    ComponentProperty { prop: PropertyData, other_ref: i32 },
    StructProperty { prop: PropertyData, struct_ref: i32 },
    FixedArrayProperty { prop: PropertyData, inner_ref: i32, count: u32 },
    ArrayProperty { prop: PropertyData, inner_ref: i32 },
    DelegateProperty { prop: PropertyData, function_ref: i32, delegate_ref: i32 },
    InterfaceProperty { prop: PropertyData, interface_ref: i32 },
    MapProperty { prop: PropertyData, key_ref: i32, value_ref: i32 },
}

/// A deserialized export: the shared object prefix plus the variant payload
/// and the human-readable trace produced while reading it.
#[derive(Debug, Clone)]
pub struct UpkObject {
    pub net_index: i32,
    pub properties: Option<DefaultPropertiesList>,
    pub text: String,
    pub body: ObjectBody,
}

impl UpkObject {
    pub fn none() -> UpkObject {
        UpkObject { net_index: 0, properties: None, text: String::new(), body: ObjectBody::None }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_structure(&self) -> bool {
        matches!(
            self.body,
            ObjectBody::Struct(_)
                | ObjectBody::ScriptStruct(_)
                | ObjectBody::Function(_)
                | ObjectBody::State(_)
                | ObjectBody::Class(_)
        )
    }

    pub fn is_state(&self) -> bool {
        matches!(self.body, ObjectBody::State(_) | ObjectBody::Class(_))
    }

    pub fn is_property(&self) -> bool {
        self.property_data().is_some()
    }

    fn property_data(&self) -> Option<&PropertyData> {
        match &self.body {
            ObjectBody::Property(prop)
            | ObjectBody::ByteProperty { prop, .. }
            | ObjectBody::ObjectProperty { prop, .. }
            | ObjectBody::ClassProperty { prop, .. }
            | ObjectBody::ComponentProperty { prop, .. }
            | ObjectBody::StructProperty { prop, .. }
            | ObjectBody::FixedArrayProperty { prop, .. }
            | ObjectBody::ArrayProperty { prop, .. }
            | ObjectBody::DelegateProperty { prop, .. }
            | ObjectBody::InterfaceProperty { prop, .. }
            | ObjectBody::MapProperty { prop, .. } => Some(prop),
            _ => None,
        }
    }

    fn field_data(&self) -> Option<&FieldData> {
        match &self.body {
            ObjectBody::Const(data) => Some(&data.field),
            ObjectBody::Enum(data) => Some(&data.field),
            ObjectBody::Struct(data) => Some(&data.field),
            ObjectBody::ScriptStruct(data) => Some(&data.strukt.field),
            ObjectBody::Function(data) => Some(&data.strukt.field),
            ObjectBody::State(data) => Some(&data.strukt.field),
            ObjectBody::Class(data) => Some(&data.state.strukt.field),
            _ => self.property_data().map(|prop| &prop.field),
        }
    }

    fn struct_data(&self) -> Option<&StructData> {
        match &self.body {
            ObjectBody::Struct(data) => Some(data),
            ObjectBody::ScriptStruct(data) => Some(&data.strukt),
            ObjectBody::Function(data) => Some(&data.strukt),
            ObjectBody::State(data) => Some(&data.strukt),
            ObjectBody::Class(data) => Some(&data.state.strukt),
            _ => None,
        }
    }

    pub fn next_ref(&self) -> i32 {
        self.field_data().map_or(0, |field| field.next_ref)
    }

    pub fn next_ref_offset(&self) -> u64 {
        self.field_data().map_or(0, |field| field.next_ref_offset)
    }

    pub fn first_child_ref(&self) -> i32 {
        self.struct_data().map_or(0, |data| data.first_child_ref)
    }

    pub fn first_child_ref_offset(&self) -> u64 {
        self.struct_data().map_or(0, |data| data.first_child_ref_offset)
    }

    pub fn script_serial_size(&self) -> u32 {
        self.struct_data().map_or(0, |data| data.script_serial_size)
    }

    pub fn script_memory_size(&self) -> u32 {
        self.struct_data().map_or(0, |data| data.script_memory_size)
    }

    pub fn script_offset(&self) -> u64 {
        self.struct_data().map_or(0, |data| data.script_offset)
    }

    pub fn inner_ref(&self) -> i32 {
        match &self.body {
            ObjectBody::ArrayProperty { inner_ref, .. } => *inner_ref,
            _ => 0,
        }
    }

    pub fn struct_obj_ref(&self) -> i32 {
        match &self.body {
            ObjectBody::StructProperty { struct_ref, .. } => *struct_ref,
            _ => 0,
        }
    }
}

struct ObjectReader<'a> {
    pkg: &'a UpkPackage,
    idx: u32,
    cur: Cursor<Vec<u8>>,
    try_unsafe: bool,
    quick: bool,
    text: String,
    serial_size: u32,
    flags_l: u32,
}

impl ObjectReader<'_> {
    fn entry_type(&self) -> String {
        self.pkg.get_entry_type(self.idx as i32)
    }

    // Component payloads are recognized by name shape; there is no flag.
    fn is_component(&self) -> bool {
        let type_name = self.entry_type();
        (type_name.contains("Component") || type_name.contains("Distribution"))
            && !type_name.contains("MaterialExpression")
            && type_name != "ComponentProperty"
    }

    fn is_dominant_directional_light_component(&self) -> bool {
        self.entry_type().contains("DominantDirectionalLightComponent")
    }

    fn is_default_properties_object(&self) -> bool {
        self.pkg.get_entry_name(self.idx as i32).contains("Default__")
    }

    fn is_subobject(&self) -> bool {
        self.pkg.get_entry_owner_full_name(self.idx as i32).contains("Default__")
    }

    fn read_object_core(&mut self, is_class: bool) -> Result<(i32, Option<DefaultPropertiesList>)> {
        if !self.is_default_properties_object() {
            if self.is_dominant_directional_light_component() {
                self.text.push_str("DominantDirectionalLightComponent:\n");
                let shadow_map_size = self.cur.read_u32::<LittleEndian>()?;
                self.text.push_str(&format!(
                    "\tDominantLightShadowMapSize = {} = {}\n",
                    format_hex(shadow_map_size),
                    shadow_map_size
                ));
                let pos = self.cur.position();
                self.cur.set_position(pos + 2 * shadow_map_size as u64);
                log_debug("Skipping DominantLightShadowMap.", SENDER);
                self.text.push_str("Cannot deserialize DominantLightShadowMap: skipping!\n");
            }
            if self.is_component() {
                self.text.push_str("UComponent:\n");
                let template_owner_class = self.cur.read_u32::<LittleEndian>()?;
                self.text.push_str(&format!(
                    "\tTemplateOwnerClass = {} = {} = {}\n",
                    format_hex(template_owner_class),
                    template_owner_class,
                    self.pkg.objref_to_name(template_owner_class as i32)
                ));
                if self.is_subobject() {
                    let template_name = read_name_index(&mut self.cur)?;
                    self.text.push_str(&format!(
                        "\tTemplateName = {} = {}\n",
                        format_hex_name(template_name),
                        self.pkg.index_to_name(template_name)
                    ));
                }
            }
        }
        self.text.push_str("UObject:\n");
        let net_index = self.cur.read_i32::<LittleEndian>()?;
        self.text
            .push_str(&format!("\tNetIndex = {} = {}\n", format_hex(net_index as u32), net_index));
        let mut properties = None;
        if !is_class {
            if self.try_unsafe && self.flags_l & ObjectFlagsL::HasStack.bits() != 0 {
                let pos = self.cur.position();
                self.cur.set_position(pos + 22);
                log_debug("Skipping stack.", SENDER);
                self.text.push_str("Cannot deserialize stack: skipping!\n");
            }
            log_debug("Deserializing default properties.", SENDER);
            let walker = PropertyWalker {
                pkg: self.pkg,
                export_idx: self.idx,
                try_unsafe: self.try_unsafe,
                quick: self.quick,
            };
            properties = Some(walker.read_list(&mut self.cur, &mut self.text)?);
        }
        Ok((net_index, properties))
    }

    fn read_field(&mut self, is_structure: bool) -> Result<FieldData> {
        self.text.push_str("UField:\n");
        let next_ref_offset = self.cur.position();
        let next_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tNextRef = {} -> {}\n",
            format_hex(next_ref as u32),
            self.pkg.objref_to_name(next_ref)
        ));
        let mut parent_ref = 0;
        if is_structure {
            parent_ref = self.cur.read_i32::<LittleEndian>()?;
            self.text.push_str(&format!(
                "\tParentRef = {} -> {}\n",
                format_hex(parent_ref as u32),
                self.pkg.objref_to_name(parent_ref)
            ));
        }
        Ok(FieldData { next_ref, parent_ref, next_ref_offset })
    }

    fn read_struct(&mut self) -> Result<StructData> {
        let field = self.read_field(true)?;
        self.text.push_str("UStruct:\n");
        let script_text_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tScriptTextRef = {} -> {}\n",
            format_hex(script_text_ref as u32),
            self.pkg.objref_to_name(script_text_ref)
        ));
        let first_child_ref_offset = self.cur.position();
        let first_child_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tFirstChildRef = {} -> {}\n",
            format_hex(first_child_ref as u32),
            self.pkg.objref_to_name(first_child_ref)
        ));
        let cpp_text_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tCppTextRef = {} -> {}\n",
            format_hex(cpp_text_ref as u32),
            self.pkg.objref_to_name(cpp_text_ref)
        ));
        let line = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tLine = {}\n", format_hex(line)));
        let text_pos = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tTextPos = {}\n", format_hex(text_pos)));
        let script_memory_size = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tScriptMemorySize = {}\n", format_hex(script_memory_size)));
        let script_serial_size = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tScriptSerialSize = {}\n", format_hex(script_serial_size)));
        if script_serial_size > 0xFFFF {
            return Err(Error::new(ErrorKind::InvalidData, "script serial size is too large"));
        }
        let script_offset = self.cur.position();
        let mut bytecode = vec![0u8; script_serial_size as usize];
        if script_serial_size > 0 {
            self.cur.read_exact(&mut bytecode)?;
            self.text.push_str("\tSkipping script bytecode.\n");
        }
        Ok(StructData {
            field,
            script_text_ref,
            first_child_ref,
            first_child_ref_offset,
            cpp_text_ref,
            line,
            text_pos,
            script_memory_size,
            script_serial_size,
            script_offset,
            bytecode,
        })
    }

    fn read_function(&mut self) -> Result<FunctionData> {
        let strukt = self.read_struct()?;
        self.text.push_str("UFunction:\n");
        let native_token = self.cur.read_u16::<LittleEndian>()?;
        self.text.push_str(&format!("\tNativeToken = {}\n", format_hex16(native_token)));
        let oper_precedence = self.cur.read_u8()?;
        self.text.push_str(&format!("\tOperPrecedence = {}\n", format_hex8(oper_precedence)));
        let function_flags = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tFunctionFlags = {}\n", format_hex(function_flags)));
        self.text.push_str(&flag_lines(&FunctionFlags::from_bits_truncate(function_flags)));
        let mut rep_offset = None;
        if function_flags & FunctionFlags::Net.bits() != 0 {
            let rep = self.cur.read_u16::<LittleEndian>()?;
            self.text.push_str(&format!("\tRepOffset = {}\n", format_hex16(rep)));
            rep_offset = Some(rep);
        }
        let name_idx = read_name_index(&mut self.cur)?;
        self.text.push_str(&format!(
            "\tNameIdx = {} -> {}\n",
            format_hex_name(name_idx),
            self.pkg.index_to_name(name_idx)
        ));
        Ok(FunctionData { strukt, native_token, oper_precedence, function_flags, rep_offset, name_idx })
    }

    fn read_script_struct(&mut self) -> Result<ScriptStructData> {
        let strukt = self.read_struct()?;
        self.text.push_str("UScriptStruct:\n");
        let struct_flags = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tStructFlags = {}\n", format_hex(struct_flags)));
        self.text.push_str(&flag_lines(&StructFlags::from_bits_truncate(struct_flags)));
        let walker = PropertyWalker {
            pkg: self.pkg,
            export_idx: self.idx,
            try_unsafe: self.try_unsafe,
            quick: self.quick,
        };
        let defaults = walker.read_list(&mut self.cur, &mut self.text)?;
        Ok(ScriptStructData { strukt, struct_flags, defaults })
    }

    fn read_state(&mut self) -> Result<StateData> {
        let strukt = self.read_struct()?;
        self.text.push_str("UState:\n");
        let probe_mask = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tProbeMask = {}\n", format_hex(probe_mask)));
        let label_table_offset = self.cur.read_u16::<LittleEndian>()?;
        self.text.push_str(&format!("\tLabelTableOffset = {}\n", format_hex16(label_table_offset)));
        let state_flags = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tStateFlags = {}\n", format_hex(state_flags)));
        self.text.push_str(&flag_lines(&StateFlags::from_bits_truncate(state_flags)));
        let mut state_map_size = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tStateMapSize = {} ({})\n",
            format_hex(state_map_size),
            state_map_size
        ));
        // Bad data guard: a state map cannot be larger than the payload.
        if state_map_size as u64 * 12 > self.serial_size as u64 {
            state_map_size = 0;
        }
        let mut state_map = Vec::new();
        for i in 0..state_map_size {
            let name = read_name_index(&mut self.cur)?;
            let objref = self.cur.read_i32::<LittleEndian>()?;
            self.text.push_str(&format!("\tStateMap[{i}]:\n"));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex_name(name),
                self.pkg.index_to_name(name)
            ));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex(objref as u32),
                self.pkg.objref_to_name(objref)
            ));
            state_map.push((name, objref));
        }
        Ok(StateData { strukt, probe_mask, label_table_offset, state_flags, state_map })
    }

    fn read_name_index_vec(&mut self, label: &str) -> Result<Vec<NameIndex>> {
        let mut count = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tNum{label} = {} ({})\n", format_hex(count), count));
        if count as u64 * 8 > self.serial_size as u64 {
            count = 0;
        }
        let mut entries = Vec::new();
        for i in 0..count {
            let name = read_name_index(&mut self.cur)?;
            self.text.push_str(&format!("\t{label}[{i}]:\n"));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex_name(name),
                self.pkg.index_to_name(name)
            ));
            entries.push(name);
        }
        Ok(entries)
    }

    fn read_class(&mut self) -> Result<ClassData> {
        let state = self.read_state()?;
        self.text.push_str("UClass:\n");
        let class_flags = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tClassFlags = {}\n", format_hex(class_flags)));
        self.text.push_str(&flag_lines(&ClassFlags::from_bits_truncate(class_flags)));
        let within_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tWithinRef = {} -> {}\n",
            format_hex(within_ref as u32),
            self.pkg.objref_to_name(within_ref)
        ));
        let config_name_idx = read_name_index(&mut self.cur)?;
        self.text.push_str(&format!(
            "\tConfigNameIdx = {} -> {}\n",
            format_hex_name(config_name_idx),
            self.pkg.index_to_name(config_name_idx)
        ));
        let mut num_components = self.cur.read_u32::<LittleEndian>()?;
        self.text
            .push_str(&format!("\tNumComponents = {} ({})\n", format_hex(num_components), num_components));
        if num_components as u64 * 12 > self.serial_size as u64 {
            num_components = 0;
        }
        let mut components = Vec::new();
        for i in 0..num_components {
            let name = read_name_index(&mut self.cur)?;
            let objref = self.cur.read_i32::<LittleEndian>()?;
            self.text.push_str(&format!("\tComponents[{i}]:\n"));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex_name(name),
                self.pkg.index_to_name(name)
            ));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex(objref as u32),
                self.pkg.objref_to_name(objref)
            ));
            components.push((name, objref));
        }
        let mut num_interfaces = self.cur.read_u32::<LittleEndian>()?;
        self.text
            .push_str(&format!("\tNumInterfaces = {} ({})\n", format_hex(num_interfaces), num_interfaces));
        if num_interfaces as u64 * 8 > self.serial_size as u64 {
            num_interfaces = 0;
        }
        let mut interfaces = Vec::new();
        for i in 0..num_interfaces {
            let objref = self.cur.read_i32::<LittleEndian>()?;
            let value = self.cur.read_u32::<LittleEndian>()?;
            self.text.push_str(&format!("\tInterfaces[{i}]:\n"));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex(objref as u32),
                self.pkg.objref_to_name(objref)
            ));
            self.text.push_str(&format!("\t\t{}\n", format_hex(value)));
            interfaces.push((objref, value));
        }
        let dont_sort_categories = self.read_name_index_vec("DontSortCategories")?;
        let hide_categories = self.read_name_index_vec("HideCategories")?;
        let auto_expand_categories = self.read_name_index_vec("AutoExpandCategories")?;
        let auto_collapse_categories = self.read_name_index_vec("AutoCollapseCategories")?;
        let force_script_order = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tForceScriptOrder = {}\n", format_hex(force_script_order)));
        let class_groups = self.read_name_index_vec("ClassGroups")?;
        let mut native_class_name_length = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tNativeClassNameLength = {}\n",
            format_hex(native_class_name_length)
        ));
        if native_class_name_length > self.serial_size {
            native_class_name_length = 0;
        }
        let mut native_class_name = String::new();
        if native_class_name_length > 0 {
            native_class_name = read_cstring(&mut self.cur)?;
            self.text.push_str(&format!("\tNativeClassName = {native_class_name}\n"));
        }
        let dll_bind_name = read_name_index(&mut self.cur)?;
        self.text.push_str(&format!(
            "\tDLLBindName = {} -> {}\n",
            format_hex_name(dll_bind_name),
            self.pkg.index_to_name(dll_bind_name)
        ));
        let default_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tDefaultRef = {} -> {}\n",
            format_hex(default_ref as u32),
            self.pkg.objref_to_name(default_ref)
        ));
        Ok(ClassData {
            state,
            class_flags,
            within_ref,
            config_name_idx,
            components,
            interfaces,
            dont_sort_categories,
            hide_categories,
            auto_expand_categories,
            auto_collapse_categories,
            force_script_order,
            class_groups,
            native_class_name,
            dll_bind_name,
            default_ref,
        })
    }

    fn read_const(&mut self) -> Result<ConstData> {
        let field = self.read_field(false)?;
        self.text.push_str("UConst:\n");
        let value_length = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tValueLength = {}\n", format_hex(value_length)));
        let mut value = String::new();
        if value_length > 0 {
            value = read_cstring(&mut self.cur)?;
            self.text.push_str(&format!("\tValue = {value}\n"));
        }
        Ok(ConstData { field, value_length, value })
    }

    fn read_enum(&mut self) -> Result<EnumData> {
        let field = self.read_field(false)?;
        self.text.push_str("UEnum:\n");
        let num_names = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tNumNames = {} ({})\n", format_hex(num_names), num_names));
        let mut names = Vec::new();
        for i in 0..num_names {
            let name = read_name_index(&mut self.cur)?;
            self.text.push_str(&format!("\tNames[{i}]:\n"));
            self.text.push_str(&format!(
                "\t\t{} -> {}\n",
                format_hex_name(name),
                self.pkg.index_to_name(name)
            ));
            names.push(name);
        }
        Ok(EnumData { field, names })
    }

    fn read_property(&mut self) -> Result<PropertyData> {
        let field = self.read_field(false)?;
        self.text.push_str("UProperty:\n");
        let packed = self.cur.read_u32::<LittleEndian>()?;
        let array_dim = (packed & 0xFFFF) as u16;
        let element_size = (packed >> 16) as u16;
        self.text
            .push_str(&format!("\tArrayDim = {} ({})\n", format_hex16(array_dim), array_dim));
        self.text
            .push_str(&format!("\tElementSize = {} ({})\n", format_hex16(element_size), element_size));
        let flags_l = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tPropertyFlagsL = {}\n", format_hex(flags_l)));
        self.text.push_str(&flag_lines(&PropertyFlagsL::from_bits_truncate(flags_l)));
        let flags_h = self.cur.read_u32::<LittleEndian>()?;
        self.text.push_str(&format!("\tPropertyFlagsH = {}\n", format_hex(flags_h)));
        self.text.push_str(&flag_lines(&PropertyFlagsH::from_bits_truncate(flags_h)));
        let category_idx = read_name_index(&mut self.cur)?;
        self.text.push_str(&format!(
            "\tCategoryIndex = {} -> {}\n",
            format_hex_name(category_idx),
            self.pkg.index_to_name(category_idx)
        ));
        let array_enum_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tArrayEnumRef = {} -> {}\n",
            format_hex(array_enum_ref as u32),
            self.pkg.objref_to_name(array_enum_ref)
        ));
        let mut rep_offset = None;
        if flags_l & PropertyFlagsL::Net.bits() != 0 {
            let rep = self.cur.read_u16::<LittleEndian>()?;
            self.text.push_str(&format!("\tRepOffset = {}\n", format_hex16(rep)));
            rep_offset = Some(rep);
        }
        Ok(PropertyData {
            field,
            array_dim,
            element_size,
            flags_l,
            flags_h,
            category_idx,
            array_enum_ref,
            rep_offset,
        })
    }

    fn read_objref_field(&mut self, header: &str, label: &str) -> Result<i32> {
        if !header.is_empty() {
            self.text.push_str(header);
        }
        let objref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\t{label} = {} -> {}\n",
            format_hex(objref as u32),
            self.pkg.objref_to_name(objref)
        ));
        Ok(objref)
    }

    fn read_level(&mut self) -> Result<LevelData> {
        self.text.push_str("ULevel:\n");
        let level_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tLevel object: {} -> {}\n",
            format_hex(level_ref as u32),
            self.pkg.objref_to_name(level_ref)
        ));
        let num_actors = self.cur.read_u32::<LittleEndian>()?;
        self.text
            .push_str(&format!("\tNum actors: {} = {}\n", format_hex(num_actors), num_actors));
        let world_info_ref = self.cur.read_i32::<LittleEndian>()?;
        self.text.push_str(&format!(
            "\tWorldInfo object: {} -> {}\n",
            format_hex(world_info_ref as u32),
            self.pkg.objref_to_name(world_info_ref)
        ));
        self.text.push_str("\tActors:\n");
        let mut actors = Vec::new();
        for _ in 0..num_actors {
            let actor = self.cur.read_i32::<LittleEndian>()?;
            self.text.push_str(&format!(
                "\t\t{}\t//\t{} -> {}\n",
                format_hex_bytes(&actor.to_le_bytes()),
                format_hex(actor as u32),
                self.pkg.objref_to_name(actor)
            ));
            actors.push(actor);
        }
        let pos = self.cur.position();
        self.text.push_str(&format!(
            "Stream relative position (debug info): {} ({})\n",
            format_hex(pos as u32),
            pos
        ));
        self.text.push_str("Object unknown, can't deserialize!\n");
        Ok(LevelData { level_ref, world_info_ref, actors })
    }
}

/// Deserializes an export payload into an object tree. The variant is chosen
/// by the entry's type string, except that exports flagged as properties
/// objects parse as bare objects.
pub(crate) fn deserialize_export(
    pkg: &UpkPackage,
    idx: u32,
    try_unsafe: bool,
    quick: bool,
) -> Result<UpkObject> {
    let entry = pkg.get_export_entry(idx);
    let kind = if entry.object_flags_h & ObjectFlagsH::PropertiesObject.bits() != 0 {
        "Object".to_string()
    } else {
        entry.type_name.clone()
    };
    let serial_size = entry.serial_size;
    let flags_l = entry.object_flags_l;
    let data = pkg.get_export_data(idx);
    if data.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "bad export data"));
    }
    let mut r = ObjectReader {
        pkg,
        idx,
        cur: Cursor::new(data),
        try_unsafe,
        quick,
        text: String::new(),
        serial_size,
        flags_l,
    };
    let is_known = matches!(
        kind.as_str(),
        "Object"
            | "Const"
            | "Enum"
            | "Struct"
            | "ScriptStruct"
            | "Function"
            | "State"
            | "Class"
            | "Property"
            | "IntProperty"
            | "BoolProperty"
            | "FloatProperty"
            | "NameProperty"
            | "StrProperty"
            | "ByteProperty"
            | "ObjectProperty"
            | "ClassProperty"
            | "ComponentProperty"
            | "StructProperty"
            | "FixedArrayProperty"
            | "ArrayProperty"
            | "DelegateProperty"
            | "InterfaceProperty"
            | "MapProperty"
            | "Level"
    );
    let mut net_index = 0;
    let mut properties = None;
    if is_known {
        let (net, props) = r.read_object_core(kind == "Class")?;
        net_index = net;
        properties = props;
    }
    let body = match kind.as_str() {
        "Object" => ObjectBody::Object,
        "Const" => ObjectBody::Const(r.read_const()?),
        "Enum" => ObjectBody::Enum(r.read_enum()?),
        "Struct" => ObjectBody::Struct(r.read_struct()?),
        "ScriptStruct" => ObjectBody::ScriptStruct(r.read_script_struct()?),
        "Function" => ObjectBody::Function(r.read_function()?),
        "State" => ObjectBody::State(r.read_state()?),
        "Class" => ObjectBody::Class(Box::new(r.read_class()?)),
        "Property" | "IntProperty" | "BoolProperty" | "FloatProperty" | "NameProperty"
        | "StrProperty" => ObjectBody::Property(r.read_property()?),
        "ByteProperty" => {
            let prop = r.read_property()?;
            let enum_ref = r.read_objref_field("UByteProperty:\n", "EnumObjRef")?;
            ObjectBody::ByteProperty { prop, enum_ref }
        }
        "ObjectProperty" => {
            let prop = r.read_property()?;
            let other_ref = r.read_objref_field("UObjectProperty:\n", "OtherObjRef")?;
            ObjectBody::ObjectProperty { prop, other_ref }
        }
        "ComponentProperty" => {
            let prop = r.read_property()?;
            let other_ref = r.read_objref_field("UObjectProperty:\n", "OtherObjRef")?;
            ObjectBody::ComponentProperty { prop, other_ref }
        }
        "ClassProperty" => {
            let prop = r.read_property()?;
            let other_ref = r.read_objref_field("UObjectProperty:\n", "OtherObjRef")?;
            let class_ref = r.read_objref_field("UClassProperty:\n", "ClassObjRef")?;
            ObjectBody::ClassProperty { prop, other_ref, class_ref }
        }
        "StructProperty" => {
            let prop = r.read_property()?;
            let struct_ref = r.read_objref_field("UStructProperty:\n", "StructObjRef")?;
            ObjectBody::StructProperty { prop, struct_ref }
        }
        "FixedArrayProperty" => {
            let prop = r.read_property()?;
            let inner_ref = r.read_objref_field("UFixedArrayProperty:\n", "InnerObjRef")?;
            let count = r.cur.read_u32::<LittleEndian>()?;
            r.text.push_str(&format!("\tCount = {} ({})\n", format_hex(count), count));
            ObjectBody::FixedArrayProperty { prop, inner_ref, count }
        }
        "ArrayProperty" => {
            let prop = r.read_property()?;
            let inner_ref = r.read_objref_field("UArrayProperty:\n", "InnerObjRef")?;
            ObjectBody::ArrayProperty { prop, inner_ref }
        }
        "DelegateProperty" => {
            let prop = r.read_property()?;
            let function_ref = r.read_objref_field("UDelegateProperty:\n", "FunctionObjRef")?;
            let delegate_ref = r.read_objref_field("", "DelegateObjRef")?;
            ObjectBody::DelegateProperty { prop, function_ref, delegate_ref }
        }
        "InterfaceProperty" => {
            let prop = r.read_property()?;
            let interface_ref = r.read_objref_field("UInterfaceProperty:\n", "InterfaceObjRef")?;
            ObjectBody::InterfaceProperty { prop, interface_ref }
        }
        "MapProperty" => {
            let prop = r.read_property()?;
            let key_ref = r.read_objref_field("UMapProperty:\n", "KeyObjRef")?;
            let value_ref = r.read_objref_field("", "ValueObjRef")?;
            ObjectBody::MapProperty { prop, key_ref, value_ref }
        }
        "Level" => ObjectBody::Level(r.read_level()?),
        _ => {
            // Unknown payload shape: only touch it under unsafe parsing.
            if r.try_unsafe {
                let (net, props) = r.read_object_core(false)?;
                net_index = net;
                properties = props;
                let pos = r.cur.position();
                if pos != serial_size as u64 {
                    r.text.push_str(&format!(
                        "Stream relative position (debug info): {} ({})\n",
                        format_hex(pos as u32),
                        pos
                    ));
                }
            }
            if r.cur.position() != serial_size as u64 {
                r.text.push_str("UObjectUnknown:\n\tObject unknown, can't deserialize!\n");
            }
            ObjectBody::Unknown
        }
    };
    Ok(UpkObject { net_index, properties, text: r.text, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testpkg::TestPackage;
    use crate::upkprops::PropertyValue;

    #[test]
    fn function_export_deserializes() {
        let mut pkg = TestPackage::with_function().load("objects_function");
        let idx = pkg.find_object_by_name("DoThing", true) as u32;
        assert!(idx > 0);
        assert!(pkg.deserialize(idx, false, false));
        let object = pkg.get_export_object(idx, false, false);
        assert!(object.is_structure());
        assert!(!object.is_state());
        match &object.body {
            ObjectBody::Function(data) => {
                assert_eq!(data.native_token, 0);
                assert_eq!(data.function_flags, 0);
                assert_eq!(data.rep_offset, None);
                assert_eq!(data.strukt.script_serial_size, 4);
                assert_eq!(data.strukt.bytecode, vec![0x0B, 0x0B, 0x0B, 0x53]);
                assert_eq!(data.strukt.field.next_ref, 0);
            }
            other => panic!("expected a function body, got {other:?}"),
        }
        assert!(object.text().contains("UFunction:"));
    }

    #[test]
    fn script_queries_use_quick_mode() {
        let mut pkg = TestPackage::with_function().load("objects_script_queries");
        let idx = pkg.find_object_by_name("DoThing", true) as u32;
        assert_eq!(pkg.get_script_size(idx), 4);
        assert_eq!(pkg.get_script_mem_size(idx), 4);
        // Bytecode starts right after the seven-field structure prefix.
        assert_eq!(pkg.get_script_rel_offset(idx), 0x30);
        // A non-structure export has no script.
        let plain = pkg.find_object_by_name("TestObj", true) as u32;
        assert_eq!(pkg.get_script_size(plain), 0);
    }

    #[test]
    fn property_exports_report_as_properties() {
        let mut pkg = TestPackage::with_array_schema().load("objects_property_kind");
        let idx = pkg.find_object_by_name("IntProp0", true) as u32;
        assert!(pkg.deserialize(idx, false, false));
        let object = pkg.get_export_object(idx, false, false);
        assert!(object.is_property());
        assert!(!object.is_structure());
        assert_eq!(object.inner_ref(), 0);
        let array = pkg.find_object_by_name("Nums", true) as u32;
        let object = pkg.get_export_object(array, false, false);
        assert!(object.inner_ref() > 0);
    }

    #[test]
    fn script_serial_size_overflow_fails() {
        let mut pkg = TestPackage::with_function_script_size(0x1_0000).load("objects_script_overflow");
        let idx = pkg.find_object_by_name("DoThing", true) as u32;
        assert!(!pkg.deserialize(idx, false, false));
    }

    #[test]
    fn oversized_state_map_is_clamped() {
        let mut pkg = TestPackage::with_state(5000).load("objects_state_guard");
        let idx = pkg.find_object_by_name("Waiting", true) as u32;
        assert!(pkg.deserialize(idx, false, false));
        let object = pkg.get_export_object(idx, false, false);
        match &object.body {
            ObjectBody::State(data) => assert!(data.state_map.is_empty()),
            other => panic!("expected a state body, got {other:?}"),
        }
    }

    #[test]
    fn properties_object_parses_as_bare_object() {
        let mut pkg = TestPackage::with_tagged_object().load("objects_props_flag");
        let idx = pkg.find_object_by_name("TaggedObj", true) as u32;
        assert!(pkg.deserialize(idx, false, false));
        let object = pkg.get_export_object(idx, false, false);
        assert!(matches!(object.body, ObjectBody::Object));
        assert_eq!(object.net_index, 0);
        let props = object.properties.as_ref().unwrap();
        assert_eq!(props.properties.len(), 2);
        assert_eq!(props.properties[0].name, "Health");
        assert!(matches!(props.properties[0].value, PropertyValue::Int(42)));
    }

    #[test]
    fn unknown_type_is_untouched_in_strict_mode() {
        let mut pkg = TestPackage::with_unknown_export().load("objects_unknown");
        let idx = pkg.find_object_by_name("Mystery", true) as u32;
        assert!(pkg.deserialize(idx, false, false));
        let object = pkg.get_export_object(idx, false, false);
        assert!(matches!(object.body, ObjectBody::Unknown));
        assert!(object.text().contains("can't deserialize"));
    }

    #[test]
    fn sentinel_object_returned_for_bad_index(){
        let mut pkg = TestPackage::basic().load("objects_sentinel");
        let object = pkg.get_export_object(9999, false, false);
        assert!(matches!(object.body, ObjectBody::None));
    }

    #[test]
    fn objects_are_cached_per_index() {
        let mut pkg = TestPackage::with_function().load("objects_cached");
        let idx = pkg.find_object_by_name("DoThing", true) as u32;
        pkg.get_export_object(idx, false, false);
        assert!(pkg.objects.contains_key(&idx));
        let before = pkg.objects.len();
        pkg.get_export_object(idx, false, false);
        assert_eq!(pkg.objects.len(), before);
    }

    #[test]
    fn bulk_data_mirror_layout() {
        let mut mirror = BulkDataMirror::from_data(vec![0xAA; 8]);
        mirror.set_file_offset(0x100 + BulkDataMirror::rel_offset());
        let bytes = mirror.serialize();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &8u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &8u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0x110u32.to_le_bytes());
        assert_eq!(&bytes[16..], &[0xAA; 8]);
    }
}
