//! Shell quoting for commands sent to the device's `/bin/sh`.

/// Quote one argument for a POSIX shell. Plain words are passed through untouched so
/// logged commands stay readable.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':' | b'=' | b'+' | b',')
        });
    if plain {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join an argv into a single shell line, quoting every argument.
pub fn join_argv(argv: &[&str]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve a remote path against the file channel's working directory.
pub fn resolve_remote(cwd: Option<&str>, path: &str) -> String {
    if path.starts_with('/') {
        return path.to_string();
    }
    match cwd {
        Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), path),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_are_not_quoted() {
        assert_eq!(shell_quote("/usr/sbin/fw_printenv"), "/usr/sbin/fw_printenv");
        assert_eq!(shell_quote("network.lan.proto"), "network.lan.proto");
    }

    #[test]
    fn special_characters_are_single_quoted() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(
            shell_quote("mtdparts=pl35x-nand:40m(BOOT)"),
            "'mtdparts=pl35x-nand:40m(BOOT)'"
        );
    }

    #[test]
    fn join_quotes_each_argument() {
        assert_eq!(join_argv(&["test", "!", "-e", "/lib/x y"]), "test '!' -e '/lib/x y'");
    }

    #[test]
    fn remote_paths_resolve_against_cwd() {
        assert_eq!(resolve_remote(Some("/tmp/firmware/"), "stage1.sh"), "/tmp/firmware/stage1.sh");
        assert_eq!(resolve_remote(Some("/tmp/firmware"), "/etc/x"), "/etc/x");
        assert_eq!(resolve_remote(None, "x"), "x");
    }
}
