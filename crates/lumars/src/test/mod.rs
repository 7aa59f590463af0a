mod test_closures;
mod test_coroutine;
mod test_dump;
mod test_errors;
mod test_gc;
mod test_metamethods;
mod test_operators;
mod test_syntax;
mod test_table;
mod test_tailcall;

use crate::{LuaVM, VmOptions};

/// Fresh VM with the core libraries loaded.
pub fn new_vm() -> Box<LuaVM> {
    let mut vm = LuaVM::new(VmOptions::default());
    vm.open_libs().expect("open core libraries");
    vm
}

/// Run a chunk that uses `assert` for its own checks.
pub fn run(source: &str) {
    let mut vm = new_vm();
    match vm.execute_string(source) {
        Ok(_) => {}
        Err(e) => panic!("chunk failed ({:?}): {}", e, vm.error_message()),
    }
}
