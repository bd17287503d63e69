use lune::{Instruction, LuaValue};
use std::mem::size_of;

fn main() {
    println!("=== Size Check ===");
    println!("LuaValue: {} bytes", size_of::<LuaValue>());
    println!("Instruction: {} bytes", size_of::<Instruction>());
}
