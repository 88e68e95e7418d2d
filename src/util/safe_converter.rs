
/// Widening casts that cannot fail on the platforms this crate supports.
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}


/// RPC integers are signed 32 bit. Counters and ids that outgrow that range are reported as
///  `i32::MAX` rather than wrapping around into negative values.
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<i32> for u64 {
    fn saturating_cast(self) -> i32 {
        i32::try_from(self).unwrap_or(i32::MAX)
    }
}
impl SaturatingCast<i32> for u32 {
    fn saturating_cast(self) -> i32 {
        i32::try_from(self).unwrap_or(i32::MAX)
    }
}
