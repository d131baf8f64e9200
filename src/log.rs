/// Emit a `tracing` warning the first time this call site is reached, and
/// nothing afterwards. A router or unrelated host that keeps sending garbage
/// should not flood the log.
macro_rules! warn_once {
    ($($arg:tt)+) => {{
        static FIRED: ::std::sync::atomic::AtomicBool = ::std::sync::atomic::AtomicBool::new(false);
        if FIRED
            .compare_exchange(
                false,
                true,
                ::std::sync::atomic::Ordering::AcqRel,
                ::std::sync::atomic::Ordering::Acquire,
            )
            .is_ok()
        {
            ::tracing::warn!($($arg)+);
        }
    }};
}
