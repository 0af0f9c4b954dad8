use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

fn is_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"_-./:=,+@%".contains(&b)
}

/// POSIX shell quoting for a single word, byte for byte. Non-UTF-8 input
/// survives unchanged inside the quotes.
pub fn quote_os(arg: &OsStr) -> OsString {
    let bytes = arg.as_bytes();
    if !bytes.is_empty() && bytes.iter().copied().all(is_safe) {
        return arg.to_os_string();
    }
    let mut out = Vec::with_capacity(bytes.len() + 2);
    out.push(b'\'');
    for &b in bytes {
        if b == b'\'' {
            out.extend_from_slice(b"'\\''");
        } else {
            out.push(b);
        }
    }
    out.push(b'\'');
    OsString::from_vec(out)
}

/// Quoted words separated by spaces, suitable for `sh -c`.
pub fn join_os<S: AsRef<OsStr>>(args: &[S]) -> OsString {
    let mut out = OsString::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(" ");
        }
        out.push(quote_os(arg.as_ref()));
    }
    out
}

/// Printable form of `quote_os`, for logs and diagnostics.
pub fn quote(arg: &OsStr) -> String {
    quote_os(arg).to_string_lossy().into_owned()
}

pub fn join<S: AsRef<OsStr>>(args: &[S]) -> String {
    join_os(args).to_string_lossy().into_owned()
}
