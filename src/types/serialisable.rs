/// Types that can be rendered onto the beanstalkd TCP connection in the
/// server -> client direction.
pub trait WireSerialise {
    /// Converts the value to its on-the-wire byte form, including the
    /// trailing CRLF.
    fn serialise_wire(&self) -> Vec<u8>;
}
