use bson::Bson;

/// Coerce numeric types into an `i64` if it would be lossless to do so. If this Bson is not
/// numeric or the conversion would be lossy (e.g. 1.5 -> 1), this returns `None`.
pub(crate) fn get_int(val: &Bson) -> Option<i64> {
    match *val {
        Bson::Int32(i) => Some(i64::from(i)),
        Bson::Int64(i) => Some(i),
        Bson::Double(f) if (f - (f as i64 as f64)).abs() <= f64::EPSILON => Some(f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_int_is_lossless() {
        assert_eq!(get_int(&Bson::Int32(1)), Some(1));
        assert_eq!(get_int(&Bson::Int64(-4)), Some(-4));
        assert_eq!(get_int(&Bson::Double(1.0)), Some(1));
        assert_eq!(get_int(&Bson::Double(1.5)), None);
        assert_eq!(get_int(&Bson::String("1".to_string())), None);
    }
}
