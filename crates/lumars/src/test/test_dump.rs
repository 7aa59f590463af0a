// Precompiled chunks: header validation and the dump/load/dump
// byte-identity law.

use crate::lua_value::chunk_serializer::{dump, load, SIGNATURE, TAIL};
use crate::test::new_vm;

const SAMPLE: &str = r#"
    local function add(a, b) return a + b end
    local total = 0
    for i = 1, 10 do total = add(total, i) end
    return total, "done", true, nil, 2.5
"#;

#[test]
fn dump_header_shape() {
    let mut vm = new_vm();
    let proto = vm.compile_named(SAMPLE, "=sample").unwrap();
    let bytes = dump(&vm, proto);
    assert_eq!(&bytes[0..4], &SIGNATURE);
    assert_eq!(bytes[4], 0x52); // version
    assert_eq!(bytes[5], 0); // format
    assert_eq!(&bytes[12..18], &TAIL);
}

#[test]
fn dump_load_dump_is_byte_identical() {
    let mut vm = new_vm();
    let proto = vm.compile_named(SAMPLE, "=sample").unwrap();
    let first = dump(&vm, proto);
    let loaded = load(&mut vm, &first, "=sample").expect("load dumped chunk");
    let second = dump(&vm, loaded);
    assert_eq!(first, second);
}

#[test]
fn loaded_chunk_runs_identically() {
    let mut vm = new_vm();
    let proto = vm.compile_named(SAMPLE, "=sample").unwrap();
    let direct = vm.execute_proto(proto).expect("direct run");
    let bytes = dump(&vm, proto);
    let loaded = load(&mut vm, &bytes, "=sample").expect("load");
    let via_dump = vm.execute_proto(loaded).expect("loaded run");
    assert_eq!(direct.len(), via_dump.len());
    assert_eq!(direct[0].as_number(), Some(55.0));
    assert_eq!(via_dump[0].as_number(), Some(55.0));
    assert!(direct[3].is_nil() && via_dump[3].is_nil());
    assert_eq!(via_dump[4].as_number(), Some(2.5));
}

#[test]
fn bad_signature_is_rejected() {
    let mut vm = new_vm();
    let proto = vm.compile_named("return 1", "=x").unwrap();
    let mut bytes = dump(&vm, proto);
    bytes[1] = b'X';
    assert!(load(&mut vm, &bytes, "=x").is_err());
}

#[test]
fn version_mismatch_is_rejected() {
    let mut vm = new_vm();
    let proto = vm.compile_named("return 1", "=x").unwrap();
    let mut bytes = dump(&vm, proto);
    bytes[4] = 0x51;
    assert!(load(&mut vm, &bytes, "=x").is_err());
    let msg = vm.error_message();
    assert!(msg.contains("version mismatch"), "got: {}", msg);
}

#[test]
fn truncated_dump_is_rejected() {
    let mut vm = new_vm();
    let proto = vm.compile_named("return 1 + 2", "=x").unwrap();
    let bytes = dump(&vm, proto);
    let cut = &bytes[..bytes.len() / 2];
    assert!(load(&mut vm, cut, "=x").is_err());
}

#[test]
fn corrupted_tail_is_rejected() {
    let mut vm = new_vm();
    let proto = vm.compile_named("return 1", "=x").unwrap();
    let mut bytes = dump(&vm, proto);
    // The tail detects newline translation.
    bytes[15] = b'\n';
    bytes[16] = b'\n';
    assert!(load(&mut vm, &bytes, "=x").is_err());
}
