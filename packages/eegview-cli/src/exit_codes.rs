pub const SUCCESS: i32 = 0;
/// Bad arguments, unreadable input or a montage that does not compile.
pub const INPUT_ERROR: i32 = 1;
pub const EXECUTION_ERROR: i32 = 2;
/// Device selection, allocation or command failure.
pub const DEVICE_ERROR: i32 = 3;
