//! Exit-status sentinel protocol
//!
//! Shell transports that expose no reliable exit status get their command
//! wrapped so the shell prints a newline and `$?` after it finishes. The
//! captured stdout then always ends in `\n<code>\n`, which is cut off again
//! here together with one line break the command itself printed last, so
//! `ls` of a single file yields just the file name. A command that prints
//! text without a trailing newline keeps it verbatim because the sentinel
//! brings its own leading newline.
//!
//! The same wrapper can print `$$` first so the caller learns the pid of the
//! shell running the command before any of its output arrives.

use crate::error::ExecError;
use crate::options::trim_line_break;

/// Shell line that prints the exit status of the previous command
pub const SENTINEL: &str = r#"printf '\n%d\n' "$?""#;

/// Quote a string for POSIX `sh`
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a directory for `cd`, keeping a leading `~` expandable
#[must_use]
pub fn quote_dir(dir: &str) -> String {
    if dir == "~" {
        "~".to_string()
    } else if let Some(rest) = dir.strip_prefix("~/") {
        format!("~/{}", shell_quote(rest))
    } else if dir.is_empty() {
        ".".to_string()
    } else {
        shell_quote(dir)
    }
}

/// Build the shell text that runs `cmd` in `cwd` and reports its exit status
///
/// The command runs in a subshell so `exit N` ends the subshell, not the
/// sentinel.
#[must_use]
pub fn wrap_command(cmd: &str, cwd: &str, pipefail: bool, with_pid: bool) -> String {
    let mut script = String::new();
    if with_pid {
        script.push_str("echo $$\n");
    }
    script.push_str(&format!("cd {} && (\n", quote_dir(cwd)));
    if pipefail {
        script.push_str("set -o pipefail\n");
    }
    script.push_str(cmd);
    script.push_str("\n)\n");
    script.push_str(SENTINEL);
    script.push('\n');
    script
}

/// Build the shell text for a detached spawn that prints its pid first
#[must_use]
pub fn wrap_spawn(cmd: &str, cwd: &str) -> String {
    format!(
        "echo $$; cd {} && exec nohup sh -c {} >/dev/null 2>&1 </dev/null",
        quote_dir(cwd),
        shell_quote(cmd)
    )
}

/// Split captured stdout into the command's own output and its exit code
///
/// The output loses one trailing line break, as if all lines but the status
/// line were joined again.
///
/// # Errors
/// Returns `ExecError::ExitStatusUndetermined` if the last line is missing or
/// not an integer
pub fn split_exit_code(raw: &str) -> Result<(String, i32), ExecError> {
    let body = raw.strip_suffix('\n').unwrap_or(raw);
    let body = body.strip_suffix('\r').unwrap_or(body);

    let (rest, last) = match body.rfind('\n') {
        Some(idx) => (&body[..idx], &body[idx + 1..]),
        None => ("", body),
    };

    let code = last.trim().parse::<i32>().map_err(|_| {
        ExecError::ExitStatusUndetermined(format!("last output line {last:?} is not an exit code"))
    })?;

    let rest = rest.strip_suffix('\r').unwrap_or(rest);
    Ok((trim_line_break(rest).to_string(), code))
}

/// Split a leading pid line off captured output
#[must_use]
pub fn split_pid_line(raw: &str) -> Option<(u32, &str)> {
    let idx = raw.find('\n')?;
    let pid = raw[..idx].trim().parse().ok()?;
    Some((pid, &raw[idx + 1..]))
}

/// Parsed form of a sentinel-wrapped command's stdout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOutput {
    /// Output of the command itself
    pub stdout: String,
    /// Exit status printed by the sentinel
    pub exit_code: i32,
    /// Pid printed by the wrapper
    pub pid: Option<u32>,
}

/// Parse the complete stdout of a command built by [`wrap_command`]
///
/// # Errors
/// Returns `ExecError::ExitStatusUndetermined` if the sentinel is malformed
pub fn parse_output(raw: &str, expect_pid: bool) -> Result<ParsedOutput, ExecError> {
    let (pid, body) = match expect_pid.then(|| split_pid_line(raw)).flatten() {
        Some((pid, rest)) => (Some(pid), rest),
        None => (None, raw),
    };
    let (stdout, exit_code) = split_exit_code(body)?;
    Ok(ParsedOutput {
        stdout,
        exit_code,
        pid,
    })
}

/// Incremental stdout filter for streaming wrapped commands
///
/// Releases text as soon as it can no longer be part of the sentinel suffix,
/// so the concatenation of everything released equals the final stdout of
/// [`parse_output`]. Text from the line break before the second-to-last
/// newline on is held back.
#[derive(Debug, Default)]
pub struct StdoutFilter {
    expect_pid: bool,
    pid: Option<u32>,
    pending: Vec<u8>,
}

impl StdoutFilter {
    /// New filter; `expect_pid` strips a leading pid line
    #[must_use]
    pub fn new(expect_pid: bool) -> Self {
        Self {
            expect_pid,
            pid: None,
            pending: Vec::new(),
        }
    }

    /// Pid parsed from the first line, once seen
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Feed raw bytes; returns text that is safe to hand to a progress callback
    pub fn push(&mut self, data: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(data);

        if self.expect_pid {
            let newline = self.pending.iter().position(|b| *b == b'\n')?;
            self.expect_pid = false;
            let line = String::from_utf8_lossy(&self.pending[..newline]);
            if let Ok(pid) = line.trim().parse() {
                self.pid = Some(pid);
                self.pending.drain(..=newline);
            }
        }

        let mut newlines = self
            .pending
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, b)| **b == b'\n')
            .map(|(i, _)| i);
        newlines.next()?;
        let mut cut = newlines.next()?;
        if cut > 0 && self.pending[cut - 1] == b'\r' {
            cut -= 1;
        }
        // the command's own final line break is dropped too
        if cut > 0 && self.pending[cut - 1] == b'\n' {
            cut -= 1;
            if cut > 0 && self.pending[cut - 1] == b'\r' {
                cut -= 1;
            }
        }
        if cut == 0 {
            return None;
        }

        let released: Vec<u8> = self.pending.drain(..cut).collect();
        Some(String::from_utf8_lossy(&released).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_output_without_trailing_newline() {
        let (stdout, code) = split_exit_code("helloworld\n0\n").unwrap();

        assert_eq!(stdout, "helloworld");
        assert_eq!(code, 0);
    }

    #[test]
    fn test_split_drops_one_trailing_line_break() {
        let (stdout, code) = split_exit_code("line\n\n2\n").unwrap();
        assert_eq!(stdout, "line");
        assert_eq!(code, 2);

        let (stdout, _) = split_exit_code("line\n\n\n2\n").unwrap();
        assert_eq!(stdout, "line\n");
    }

    #[test]
    fn test_ls_of_new_file() {
        // what `touch helloworld && ls helloworld` prints once wrapped
        let raw = "helloworld\n\n0\n";
        let parsed = parse_output(raw, false).unwrap();

        assert_eq!(parsed.stdout, "helloworld");
        assert_eq!(parsed.exit_code, 0);
    }

    #[test]
    fn test_split_empty_output() {
        for n in [0, 1, 2, 127] {
            let (stdout, code) = split_exit_code(&format!("\n{n}\n")).unwrap();
            assert_eq!(stdout, "");
            assert_eq!(code, n);
        }
    }

    #[test]
    fn test_split_crlf_from_pty() {
        let (stdout, code) = split_exit_code("hi\r\n3\r\n").unwrap();

        assert_eq!(stdout, "hi");
        assert_eq!(code, 3);
    }

    #[test]
    fn test_split_missing_sentinel() {
        assert!(matches!(
            split_exit_code(""),
            Err(ExecError::ExitStatusUndetermined(_))
        ));
        assert!(matches!(
            split_exit_code("output\nnot-a-number\n"),
            Err(ExecError::ExitStatusUndetermined(_))
        ));
    }

    #[test]
    fn test_split_pid_line() {
        assert_eq!(split_pid_line("4242\nrest"), Some((4242, "rest")));
        assert_eq!(split_pid_line("4242"), None);
        assert_eq!(split_pid_line("abc\nrest"), None);
    }

    #[test]
    fn test_parse_output_with_pid() {
        let parsed = parse_output("991\nhello\n0\n", true).unwrap();

        assert_eq!(parsed.pid, Some(991));
        assert_eq!(parsed.stdout, "hello");
        assert_eq!(parsed.exit_code, 0);
    }

    #[test]
    fn test_wrap_command_shape() {
        let script = wrap_command("exit 3", "/srv/app", true, false);

        assert_eq!(
            script,
            "cd '/srv/app' && (\nset -o pipefail\nexit 3\n)\nprintf '\\n%d\\n' \"$?\"\n"
        );
    }

    #[test]
    fn test_wrap_command_with_pid_prints_pid_first() {
        let script = wrap_command("true", ".", false, true);

        assert!(script.starts_with("echo $$\ncd '.' && (\n"));
    }

    #[test]
    fn test_quote_dir() {
        assert_eq!(quote_dir("it's"), r"'it'\''s'");
        assert_eq!(quote_dir("~/work dir"), "~/'work dir'");
        assert_eq!(quote_dir(""), ".");
    }

    #[test]
    fn test_wrap_spawn_detaches() {
        let script = wrap_spawn("sleep 5", "/tmp");

        assert_eq!(
            script,
            "echo $$; cd '/tmp' && exec nohup sh -c 'sleep 5' >/dev/null 2>&1 </dev/null"
        );
    }

    fn stream_through(chunks: &[&str], expect_pid: bool) -> (String, Option<u32>) {
        let mut filter = StdoutFilter::new(expect_pid);
        let mut released = String::new();
        for chunk in chunks {
            if let Some(text) = filter.push(chunk.as_bytes()) {
                released.push_str(&text);
            }
        }
        (released, filter.pid())
    }

    #[test]
    fn test_filter_matches_final_stdout() {
        let chunks = ["first li", "ne\nsecond\n", "third", "\n", "\n0", "\n"];
        let raw: String = chunks.concat();

        let (released, _) = stream_through(&chunks, false);
        let parsed = parse_output(&raw, false).unwrap();

        assert_eq!(released, parsed.stdout);
        assert_eq!(released, "first line\nsecond\nthird");
    }

    #[test]
    fn test_filter_without_trailing_newline() {
        let chunks = ["hello", "\n0\n"];
        let (released, _) = stream_through(&chunks, false);

        assert_eq!(released, "hello");
        assert_eq!(parse_output(&chunks.concat(), false).unwrap().stdout, released);
    }

    #[test]
    fn test_filter_strips_pid() {
        let chunks = ["12", "3\nout\nmore\n", "\n5\n"];
        let raw: String = chunks.concat();

        let (released, pid) = stream_through(&chunks, true);
        let parsed = parse_output(&raw, true).unwrap();

        assert_eq!(pid, Some(123));
        assert_eq!(parsed.pid, Some(123));
        assert_eq!(parsed.exit_code, 5);
        assert_eq!(released, "out\nmore");
        assert_eq!(released, parsed.stdout);
    }

    #[test]
    fn test_filter_blank_lines_inside_output() {
        let chunks = ["a\n\nb\n", "\n0\n"];
        let (released, _) = stream_through(&chunks, false);

        assert_eq!(released, "a\n\nb");
        assert_eq!(parse_output(&chunks.concat(), false).unwrap().stdout, released);
    }

    #[test]
    fn test_filter_holds_carriage_return() {
        let chunks = ["a\r\nb\r\n", "\r\n0\r\n"];
        let (released, _) = stream_through(&chunks, false);

        assert_eq!(released, "a\r\nb");
        assert_eq!(parse_output(&chunks.concat(), false).unwrap().stdout, released);
    }
}
