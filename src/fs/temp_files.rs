/// Name endings that editors use for swap and backup files.
/// Such files live only in the shadow directory and are never uploaded.
pub const TEMP_SUFFIXES: &[&str] = &["~", ".swo", ".swp", "swx", "swpx"];

pub fn is_editor_temp(name: &str) -> bool {
    TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}
