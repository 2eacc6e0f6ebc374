/// Static typing of the fixed attribute schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Numeric,
    Date,
    Str,
}

/// Schema consumed by the backend compilers. Names outside the table are
/// treated as string-typed.
pub fn property_type(name: &str) -> PropertyType {
    match name {
        "uid" | "size" | "mailbox-id" | "x-mail-count" => PropertyType::Numeric,
        "internal-date" | "date" => PropertyType::Date,
        _ => PropertyType::Str,
    }
}

/// Ordering comparisons are only legal on these
pub fn is_numeric_or_date(name: &str) -> bool {
    property_type(name) != PropertyType::Str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_typing() {
        assert_eq!(property_type("uid"), PropertyType::Numeric);
        assert_eq!(property_type("internal-date"), PropertyType::Date);
        assert_eq!(property_type("subject"), PropertyType::Str);
        assert_eq!(property_type("flags"), PropertyType::Str);
        assert!(is_numeric_or_date("x-mail-count"));
        assert!(!is_numeric_or_date("x-ml-name"));
    }
}
