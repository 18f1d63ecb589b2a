//! Shell-free process and socket inspection through the kernel's `/proc`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// TCP state code for LISTEN in `/proc/net/tcp{,6}`.
const TCP_LISTEN: &str = "0A";
/// The kernel truncates `comm` to 15 bytes.
const COMM_LEN: usize = 15;

/// View of a `/proc`-style directory. Tests point it at a fixture tree.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Every numeric entry under the root.
    pub fn pids(&self) -> io::Result<Vec<i32>> {
        let mut pids: Vec<i32> = fs::read_dir(&self.root)?
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .filter(|pid| *pid > 0)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    /// NUL-separated argv of a process.
    #[must_use]
    pub fn cmdline(&self, pid: i32) -> Option<Vec<String>> {
        let raw = fs::read(self.pid_dir(pid).join("cmdline")).ok()?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        (!args.is_empty()).then_some(args)
    }

    #[must_use]
    pub fn comm(&self, pid: i32) -> Option<String> {
        fs::read_to_string(self.pid_dir(pid).join("comm"))
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    /// Single-letter scheduler state from `stat` (`R`, `S`, `Z`, ...).
    #[must_use]
    pub fn state(&self, pid: i32) -> Option<char> {
        let stat = fs::read_to_string(self.pid_dir(pid).join("stat")).ok()?;
        // comm may contain spaces and parens; the state follows the last ')'.
        let (_, rest) = stat.rsplit_once(')')?;
        rest.trim_start().chars().next()
    }

    #[must_use]
    pub fn exists(&self, pid: i32) -> bool {
        self.pid_dir(pid).is_dir()
    }

    /// Gone or a zombie waiting to be reaped.
    #[must_use]
    pub fn is_dead(&self, pid: i32) -> bool {
        !self.exists(pid) || self.state(pid) == Some('Z')
    }

    /// Whether `pid` is a process called `name`, by `comm` or argv[0].
    #[must_use]
    pub fn process_matches(&self, pid: i32, name: &str) -> bool {
        let truncated: String = name.chars().take(COMM_LEN).collect();
        if self.comm(pid).is_some_and(|c| c == truncated) {
            return true;
        }
        self.cmdline(pid)
            .and_then(|args| args.into_iter().next())
            .is_some_and(|argv0| Path::new(&argv0).file_name().is_some_and(|f| f == name))
    }

    /// Live (non-zombie) processes called `name`, excluding the current process.
    pub fn find_processes(&self, name: &str) -> io::Result<Vec<i32>> {
        let own = std::process::id() as i32;
        Ok(self
            .pids()?
            .into_iter()
            .filter(|pid| *pid != own)
            .filter(|pid| self.process_matches(*pid, name))
            .filter(|pid| self.state(*pid) != Some('Z'))
            .collect())
    }

    /// Whether any socket listens on TCP `port` (IPv4 or IPv6).
    #[must_use]
    pub fn port_listening(&self, port: u16) -> bool {
        ["net/tcp", "net/tcp6"].iter().any(|table| {
            fs::read_to_string(self.root.join(table))
                .map(|content| tcp_table_has_listener(&content, port))
                .unwrap_or(false)
        })
    }
}

/// Scan one `/proc/net/tcp`-format table for a LISTEN entry on `port`.
#[must_use]
pub fn tcp_table_has_listener(content: &str, port: u16) -> bool {
    let wanted = format!("{port:04X}");
    content.lines().skip(1).any(|line| {
        let mut fields = line.split_whitespace();
        let (Some(_sl), Some(local), Some(_remote), Some(state)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return false;
        };
        state == TCP_LISTEN
            && local
                .rsplit_once(':')
                .is_some_and(|(_, p)| p.eq_ignore_ascii_case(&wanted))
    })
}

/// Remove a file or a directory tree. Directory removal descends through
/// directory handles rather than re-resolving paths, so a concurrently swapped
/// symlink cannot redirect it. A missing path is not an error.
pub fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod fixture {
    use std::fs;
    use std::path::Path;

    /// Write a fake `/proc/<pid>` entry.
    pub fn add_process(root: &Path, pid: i32, comm: &str, argv: &[&str], state: char) {
        let dir = root.join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        let mut cmdline = argv.join("\0");
        cmdline.push('\0');
        fs::write(dir.join("cmdline"), cmdline).unwrap();
        fs::write(
            dir.join("stat"),
            format!("{pid} ({comm}) {state} 1 {pid} {pid} 0 -1 4194560"),
        )
        .unwrap();
    }
}
