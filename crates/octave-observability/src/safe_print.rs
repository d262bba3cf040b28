// Stderr logging that never panics.
//
// The supervisor can live inside a GUI process with no console attached; a
// plain `eprintln!` panics there when the write fails. Write errors are dropped.

#[macro_export]
macro_rules! safe_eprintln {
    ($($arg:tt)*) => {{
        use std::io::Write;
        let _ = writeln!(std::io::stderr(), $($arg)*);
    }};
}
