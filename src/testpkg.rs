//! In-memory package image builder shared by the unit tests. Lays out a
//! complete file: summary, name/import/export tables and the serial region,
//! with all offsets computed the way the codec expects to find them.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::upkreader::{PACKAGE_TAG, PACKAGE_VERSION, UpkPackage};

const SUMMARY_SIZE: u32 = 100;

pub struct TestImport {
    pub package: &'static str,
    pub class: &'static str,
    pub owner: i32,
    pub name: &'static str,
}

pub struct TestExport {
    pub type_ref: i32,
    pub owner: i32,
    pub name: String,
    pub flags_h: u32,
    pub flags_l: u32,
    pub payload: Vec<u8>,
}

pub struct TestPackage {
    pub names: Vec<&'static str>,
    pub imports: Vec<TestImport>,
    pub exports: Vec<TestExport>,
}

impl TestPackage {
    pub fn basic() -> TestPackage {
        let names = vec![
            "None",
            "Core",
            "Class",
            "Package",
            "Object",
            "Engine",
            "TestObj",
            "TestClass",
            "Function",
            "DoThing",
            "State",
            "Waiting",
            "IntProperty",
            "BoolProperty",
            "FloatProperty",
            "StrProperty",
            "ByteProperty",
            "ArrayProperty",
            "StructProperty",
            "NameProperty",
            "ObjectProperty",
            "Caption",
            "Enabled",
            "Kind",
            "Huge",
            "VertexData",
            "Padded",
            "After",
            "Odd",
            "Health",
            "TaggedObj",
            "Mystery",
            "Widget",
            "Nums",
            "IntProp0",
        ];
        let imports = vec![
            TestImport { package: "Core", class: "Package", owner: 0, name: "Core" },
            TestImport { package: "Core", class: "Class", owner: -1, name: "Object" },
            TestImport { package: "Core", class: "Class", owner: -1, name: "Function" },
            TestImport { package: "Core", class: "Class", owner: -1, name: "State" },
            TestImport { package: "Engine", class: "Class", owner: -1, name: "Widget" },
            TestImport { package: "Core", class: "Class", owner: -1, name: "ArrayProperty" },
            TestImport { package: "Core", class: "Class", owner: -1, name: "IntProperty" },
        ];
        let mut pkg = TestPackage { names, imports, exports: Vec::new() };
        let payload = {
            let mut list = PropList::new(&pkg);
            list.none();
            list.into_payload()
        };
        pkg.exports.push(TestExport {
            type_ref: -2,
            owner: 0,
            name: "TestObj".into(),
            flags_h: 0,
            flags_l: 0,
            payload,
        });
        pkg.exports.push(TestExport {
            type_ref: 0,
            owner: 0,
            name: "TestClass".into(),
            flags_h: 0,
            flags_l: 0,
            payload: vec![0u8; 4],
        });
        pkg
    }

    pub fn with_function() -> TestPackage {
        TestPackage::with_function_script_size(4)
    }

    pub fn with_function_script_size(script_serial_size: u32) -> TestPackage {
        let mut pkg = TestPackage::basic();
        let mut payload = {
            let mut list = PropList::new(&pkg);
            list.none();
            list.into_payload()
        };
        payload.extend_from_slice(&0i32.to_le_bytes()); // next ref
        payload.extend_from_slice(&0i32.to_le_bytes()); // parent ref
        payload.extend_from_slice(&0i32.to_le_bytes()); // script text
        payload.extend_from_slice(&0i32.to_le_bytes()); // first child
        payload.extend_from_slice(&0i32.to_le_bytes()); // cpp text
        payload.extend_from_slice(&0u32.to_le_bytes()); // line
        payload.extend_from_slice(&0u32.to_le_bytes()); // text pos
        payload.extend_from_slice(&script_serial_size.to_le_bytes()); // memory size
        payload.extend_from_slice(&script_serial_size.to_le_bytes()); // serial size
        if script_serial_size <= 0xFFFF {
            let mut bytecode = vec![0x0Bu8; script_serial_size as usize];
            if let Some(last) = bytecode.last_mut() {
                *last = 0x53;
            }
            payload.extend_from_slice(&bytecode);
            payload.extend_from_slice(&0u16.to_le_bytes()); // native token
            payload.push(0); // operator precedence
            payload.extend_from_slice(&0u32.to_le_bytes()); // function flags
            payload.extend_from_slice(&pkg.name_ref("DoThing"));
        }
        pkg.exports.push(TestExport {
            type_ref: -3,
            owner: 0,
            name: "DoThing".into(),
            flags_h: 0,
            flags_l: 0,
            payload,
        });
        pkg
    }

    pub fn with_state(state_map_size: u32) -> TestPackage {
        let mut pkg = TestPackage::basic();
        let mut payload = {
            let mut list = PropList::new(&pkg);
            list.none();
            list.into_payload()
        };
        payload.extend_from_slice(&0i32.to_le_bytes()); // next ref
        payload.extend_from_slice(&0i32.to_le_bytes()); // parent ref
        payload.extend_from_slice(&0i32.to_le_bytes()); // script text
        payload.extend_from_slice(&0i32.to_le_bytes()); // first child
        payload.extend_from_slice(&0i32.to_le_bytes()); // cpp text
        payload.extend_from_slice(&0u32.to_le_bytes()); // line
        payload.extend_from_slice(&0u32.to_le_bytes()); // text pos
        payload.extend_from_slice(&0u32.to_le_bytes()); // memory size
        payload.extend_from_slice(&0u32.to_le_bytes()); // serial size
        payload.extend_from_slice(&0u32.to_le_bytes()); // probe mask
        payload.extend_from_slice(&0u16.to_le_bytes()); // label table offset
        payload.extend_from_slice(&0u32.to_le_bytes()); // state flags
        payload.extend_from_slice(&state_map_size.to_le_bytes());
        pkg.exports.push(TestExport {
            type_ref: -4,
            owner: 0,
            name: "Waiting".into(),
            flags_h: 0,
            flags_l: 0,
            payload,
        });
        pkg
    }

    pub fn with_tagged_object() -> TestPackage {
        let mut pkg = TestPackage::basic();
        let payload = {
            let mut list = PropList::new(&pkg);
            list.int_record("Health", 42);
            list.none();
            list.into_payload()
        };
        pkg.exports.push(TestExport {
            type_ref: -5,
            owner: 0,
            name: "TaggedObj".into(),
            flags_h: 0x200,
            flags_l: 0,
            payload,
        });
        pkg
    }

    pub fn with_unknown_export() -> TestPackage {
        let mut pkg = TestPackage::basic();
        pkg.exports.push(TestExport {
            type_ref: -5,
            owner: 0,
            name: "Mystery".into(),
            flags_h: 0,
            flags_l: 0,
            payload: vec![0u8; 4],
        });
        pkg
    }

    /// Adds an `ArrayProperty` schema export `TestObj.Nums` whose inner
    /// reference points at an `IntProperty` export.
    pub fn with_array_schema() -> TestPackage {
        let mut pkg = TestPackage::basic();
        let inner_export_idx = pkg.exports.len() as i32 + 2; // Nums, then IntProp0
        let mut array_payload = {
            let mut list = PropList::new(&pkg);
            list.none();
            list.into_payload()
        };
        array_payload.extend_from_slice(&0i32.to_le_bytes()); // next ref
        array_payload.extend_from_slice(&0u32.to_le_bytes()); // array dim / elem size
        array_payload.extend_from_slice(&0u32.to_le_bytes()); // property flags l
        array_payload.extend_from_slice(&0u32.to_le_bytes()); // property flags h
        array_payload.extend_from_slice(&pkg.name_ref("None")); // category
        array_payload.extend_from_slice(&0i32.to_le_bytes()); // array enum ref
        array_payload.extend_from_slice(&inner_export_idx.to_le_bytes()); // inner ref
        pkg.exports.push(TestExport {
            type_ref: -6,
            owner: 1,
            name: "Nums".into(),
            flags_h: 0,
            flags_l: 0,
            payload: array_payload,
        });
        let mut int_payload = {
            let mut list = PropList::new(&pkg);
            list.none();
            list.into_payload()
        };
        int_payload.extend_from_slice(&0i32.to_le_bytes()); // next ref
        int_payload.extend_from_slice(&0u32.to_le_bytes()); // array dim / elem size
        int_payload.extend_from_slice(&0u32.to_le_bytes()); // property flags l
        int_payload.extend_from_slice(&0u32.to_le_bytes()); // property flags h
        int_payload.extend_from_slice(&pkg.name_ref("None")); // category
        int_payload.extend_from_slice(&0i32.to_le_bytes()); // array enum ref
        pkg.exports.push(TestExport {
            type_ref: -7,
            owner: 1,
            name: "IntProp0".into(),
            flags_h: 0,
            flags_l: 0,
            payload: int_payload,
        });
        pkg
    }

    pub fn with_payload(mut self, export_name: &str, payload: Vec<u8>) -> TestPackage {
        let export = self
            .exports
            .iter_mut()
            .find(|e| e.name == export_name)
            .unwrap_or_else(|| panic!("no export named {export_name}"));
        export.payload = payload;
        self
    }

    pub fn name_idx(&self, name: &str) -> u32 {
        self.names
            .iter()
            .position(|&n| n == name)
            .unwrap_or_else(|| panic!("name {name} not in test name table")) as u32
    }

    pub fn name_ref(&self, name: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&self.name_idx(name).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes
    }

    fn name_entry_size(name: &str) -> u32 {
        4 + name.len() as u32 + 1 + 8
    }

    pub fn build(&self) -> Vec<u8> {
        let name_offset = SUMMARY_SIZE;
        let names_size: u32 = self.names.iter().map(|n| Self::name_entry_size(n)).sum();
        let import_offset = name_offset + names_size;
        let export_offset = import_offset + self.imports.len() as u32 * 28;
        let depends_offset = export_offset + self.exports.len() as u32 * 68;
        let serial_offset = depends_offset;

        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(PACKAGE_TAG).unwrap();
        out.write_u32::<LittleEndian>((64u32 << 16) | PACKAGE_VERSION as u32).unwrap();
        out.write_u32::<LittleEndian>(serial_offset).unwrap(); // header size
        out.write_i32::<LittleEndian>(0).unwrap(); // folder name length
        out.write_u32::<LittleEndian>(0).unwrap(); // package flags
        out.write_u32::<LittleEndian>(self.names.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(name_offset).unwrap();
        out.write_u32::<LittleEndian>(self.exports.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(export_offset).unwrap();
        out.write_u32::<LittleEndian>(self.imports.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(import_offset).unwrap();
        out.write_u32::<LittleEndian>(depends_offset).unwrap();
        out.write_u32::<LittleEndian>(serial_offset).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap(); // unknown2
        out.write_u32::<LittleEndian>(0).unwrap(); // unknown3
        out.write_u32::<LittleEndian>(0).unwrap(); // unknown4
        for v in [1u32, 2, 3, 4] {
            out.write_u32::<LittleEndian>(v).unwrap(); // guid
        }
        out.write_u32::<LittleEndian>(0).unwrap(); // generations
        out.write_u32::<LittleEndian>(6428).unwrap(); // engine version
        out.write_u32::<LittleEndian>(64).unwrap(); // cooker version
        out.write_u32::<LittleEndian>(0).unwrap(); // compression flags
        out.write_u32::<LittleEndian>(0).unwrap(); // compressed chunks
        assert_eq!(out.len() as u32, SUMMARY_SIZE);

        for name in &self.names {
            out.write_i32::<LittleEndian>(name.len() as i32 + 1).unwrap();
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            out.write_u32::<LittleEndian>(0).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap();
        }
        assert_eq!(out.len() as u32, import_offset);

        for import in &self.imports {
            out.extend_from_slice(&self.name_ref(import.package));
            out.extend_from_slice(&self.name_ref(import.class));
            out.write_i32::<LittleEndian>(import.owner).unwrap();
            out.extend_from_slice(&self.name_ref(import.name));
        }
        assert_eq!(out.len() as u32, export_offset);

        let mut payload_offset = serial_offset;
        for export in &self.exports {
            out.write_i32::<LittleEndian>(export.type_ref).unwrap();
            out.write_i32::<LittleEndian>(0).unwrap(); // parent class
            out.write_i32::<LittleEndian>(export.owner).unwrap();
            out.extend_from_slice(&self.name_ref(&export.name));
            out.write_i32::<LittleEndian>(0).unwrap(); // archetype
            out.write_u32::<LittleEndian>(export.flags_h).unwrap();
            out.write_u32::<LittleEndian>(export.flags_l).unwrap();
            out.write_u32::<LittleEndian>(export.payload.len() as u32).unwrap();
            out.write_u32::<LittleEndian>(payload_offset).unwrap();
            out.write_u32::<LittleEndian>(0).unwrap(); // export flags
            out.write_u32::<LittleEndian>(0).unwrap(); // net object count
            for _ in 0..4 {
                out.write_u32::<LittleEndian>(0).unwrap(); // guid
            }
            out.write_u32::<LittleEndian>(0).unwrap(); // unknown1
            payload_offset += export.payload.len() as u32;
        }
        assert_eq!(out.len() as u32, depends_offset);

        for export in &self.exports {
            out.extend_from_slice(&export.payload);
        }
        out
    }

    pub fn load(&self, package_name: &str) -> UpkPackage {
        UpkPackage::load_from_bytes(package_name, self.build()).unwrap()
    }
}

/// Byte builder for default-property lists.
pub struct PropList<'a> {
    pkg: &'a TestPackage,
    buf: Vec<u8>,
}

impl<'a> PropList<'a> {
    pub fn new(pkg: &'a TestPackage) -> PropList<'a> {
        PropList { pkg, buf: Vec::new() }
    }

    pub fn record(&mut self, name: &str, type_name: &str, body: &[u8]) {
        self.record_with_size(name, type_name, body.len() as u32, body);
    }

    pub fn record_with_size(&mut self, name: &str, type_name: &str, size: u32, body: &[u8]) {
        self.buf.extend_from_slice(&self.pkg.name_ref(name));
        self.buf.extend_from_slice(&self.pkg.name_ref(type_name));
        self.buf.extend_from_slice(&size.to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.buf.extend_from_slice(body);
    }

    pub fn bool_record(&mut self, name: &str, value: u8) {
        self.buf.extend_from_slice(&self.pkg.name_ref(name));
        self.buf.extend_from_slice(&self.pkg.name_ref("BoolProperty"));
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.buf.push(value);
    }

    pub fn byte_record(&mut self, name: &str, inner_name: &str, body: &[u8]) {
        self.buf.extend_from_slice(&self.pkg.name_ref(name));
        self.buf.extend_from_slice(&self.pkg.name_ref("ByteProperty"));
        self.buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&0u32.to_le_bytes());
        self.buf.extend_from_slice(&self.pkg.name_ref(inner_name));
        self.buf.extend_from_slice(body);
    }

    pub fn int_record(&mut self, name: &str, value: i32) {
        self.record(name, "IntProperty", &value.to_le_bytes());
    }

    pub fn none(&mut self) {
        self.buf.extend_from_slice(&self.pkg.name_ref("None"));
    }

    /// Payload bytes: a zero net index followed by the list.
    pub fn into_payload(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.buf.len());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&self.buf);
        out
    }
}
