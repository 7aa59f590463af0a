pub mod chunk_serializer;
pub mod conversions;
pub mod table;
pub mod value;

pub use table::{LuaTable, Node, TableError};
pub use value::{LuaValue, LUA_NUMTAGS};
