//! Small validation helpers used by `Settings::validate`.
use std::ops::RangeInclusive;

/// Validates that a value is strictly positive and finite.
///
/// # Arguments
///
/// * `value` - The value to validate.
///
/// # Returns
///
/// * `Ok(())` if the value is valid.
/// * `Err(&'static str)` otherwise.
pub fn is_positive(value: f64) -> Result<(), &'static str> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err("Value must be a finite number greater than 0")
    }
}

/// Validates that a value is finite.
pub fn is_finite(value: f64) -> Result<(), &'static str> {
    if value.is_finite() {
        Ok(())
    } else {
        Err("Value must be finite")
    }
}

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is a valid file path.
pub fn is_valid_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() {
        return Err("File path cannot be empty");
    }
    if path.contains('\0') {
        return Err("File path cannot contain null bytes");
    }
    Ok(())
}

/// Validates if a given string is not empty.
pub fn is_not_empty(s: &str) -> Result<(), &'static str> {
    if s.trim().is_empty() {
        Err("String cannot be empty")
    } else {
        Ok(())
    }
}

/// Validates that no name appears twice.
pub fn is_unique<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), &'static str> {
    let mut seen = std::collections::HashSet::new();
    for n in names {
        if !seen.insert(n) {
            return Err("Names must be unique");
        }
    }
    Ok(())
}
