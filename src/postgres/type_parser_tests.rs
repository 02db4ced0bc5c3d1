#[cfg(test)]
mod tests {
    use crate::postgres::types::{binary_to_hex, parse_postgres_value};
    use serde_json::{json, Value};

    #[test]
    fn test_bool_parsing() {
        assert_eq!(parse_postgres_value("t", 16), Value::Bool(true));
        assert_eq!(parse_postgres_value("f", 16), Value::Bool(false));
        assert_eq!(parse_postgres_value("invalid", 16), Value::String("invalid".to_string()));
    }

    #[test]
    fn test_integer_parsing() {
        // int2
        assert_eq!(parse_postgres_value("123", 21), Value::Number(123.into()));
        assert_eq!(parse_postgres_value("invalid", 21), Value::String("invalid".to_string()));

        // int4
        assert_eq!(parse_postgres_value("456789", 23), Value::Number(456789.into()));

        // int8
        assert_eq!(parse_postgres_value("9876543210", 20), Value::Number(9876543210i64.into()));

        // oid
        assert_eq!(parse_postgres_value("16384", 26), Value::Number(16384.into()));
    }

    #[test]
    fn test_float_parsing() {
        let result = parse_postgres_value("3.14", 700);
        assert!((result.as_f64().unwrap() - 3.14).abs() < 0.001);

        let result = parse_postgres_value("2.718281828", 701);
        assert!((result.as_f64().unwrap() - 2.718281828).abs() < 0.000001);
    }

    #[test]
    fn test_non_finite_floats_stay_strings() {
        assert_eq!(parse_postgres_value("NaN", 701), Value::String("NaN".to_string()));
        assert_eq!(parse_postgres_value("Infinity", 700), Value::String("Infinity".to_string()));
    }

    #[test]
    fn test_json_parsing() {
        assert_eq!(parse_postgres_value(r#"{"key": "value"}"#, 114), json!({"key": "value"}));
        assert_eq!(parse_postgres_value("[1, 2]", 3802), json!([1, 2]));
        assert_eq!(parse_postgres_value("{broken", 3802), Value::String("{broken".to_string()));
    }

    #[test]
    fn test_string_types() {
        assert_eq!(parse_postgres_value("Hello, World!", 25), Value::String("Hello, World!".to_string()));
        assert_eq!(parse_postgres_value("Variable length", 1043), Value::String("Variable length".to_string()));
        assert_eq!(
            parse_postgres_value("2023-10-15 10:30:00+00", 1184),
            Value::String("2023-10-15 10:30:00+00".to_string())
        );
        assert_eq!(
            parse_postgres_value("550e8400-e29b-41d4-a716-446655440000", 2950),
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string())
        );
    }

    #[test]
    fn test_binary_rendering() {
        assert_eq!(binary_to_hex(&[0xde, 0xad, 0x01]), Value::String("\\xdead01".to_string()));
        assert_eq!(binary_to_hex(&[]), Value::String("\\x".to_string()));
    }
}
