//! The command vocabulary spoken to probed devices, and the parsers for
//! their output. The regular expressions here are the entire contract with
//! the target OS tooling.

use regex::Regex;
use std::sync::LazyLock;

use super::ProbeError;

pub const CMD_UNAME: &str = "/usr/bin/uname -s";
pub const CMD_OS_RELEASE: &str = "/bin/cat /etc/os-release";
pub const CMD_UPTIME: &str = "/usr/bin/uptime";
pub const CMD_DISK_FREE: &str = "env LC_ALL=en_EN.UTF-8 df -h /";

pub const CMD_UPDATES_APT: &str = "/usr/bin/apt list --upgradable";
pub const CMD_UPDATES_ZYPPER: &str = "zypper lu";
pub const CMD_UPDATES_DNF: &str = "env DNF5_FORCE_INTERACTIVE=0 dnf check-upgrade";
pub const CMD_UPDATES_CHECKUPDATES: &str = "checkupdates";
pub const CMD_UPDATES_SYSPATCH: &str = "doas syspatch -c";
pub const CMD_UPDATES_FREEBSD: &str = "doas freebsd-update updatesready";

// Sample output:
// 18:01:18  2 Tage  0:22 an,  2 Benutzer,  Durchschnittslast: 1,08, 0,98, 0,94
// 6:02PM  up 56 days,  5:16, 4 users, load averages: 0.00, 0.01, 0.00
static UPTIME_PAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r":\s+(\d+[,.]\d+),?\s+(\d+[,.]\d+),?\s+(\d+[,.]\d+)$").unwrap()
});

static APT_PAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^/]+)/(\S+)\s+(\S+)\s+(\S+)").unwrap());

static ZYPPER_SEP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+\|\s+").unwrap());

static CHECKUPDATES_PAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)\s+(\S+)\s+->\s+(\S+)$").unwrap());

static WORD_PAT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w").unwrap());

static DF_USED_PAT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)%").unwrap());

/// What a non-zero exit status of a remote command means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// The command succeeded, output is valid.
    Success,
    /// The command signalled "nothing to report".
    Empty,
    /// A genuine failure.
    Failure,
}

/// Folds the command-specific exit conventions into one disposition:
/// dnf exits 100 when updates ARE available, checkupdates exits 2 when none
/// are, and so does freebsd-update.
pub fn normalize_exit_status(command: &str, status: u32) -> ExitDisposition {
    if status == 0 {
        return ExitDisposition::Success;
    }
    if command.contains("dnf check-upgrade") && status == 100 {
        return ExitDisposition::Success;
    }
    if command.starts_with("checkupdates") && status == 2 {
        return ExitDisposition::Empty;
    }
    if command.contains("freebsd-update") && status == 2 {
        return ExitDisposition::Empty;
    }
    ExitDisposition::Failure
}

/// The update-list command for a given OS identity, if the OS is one the
/// probe knows how to ask.
pub fn update_command(os: &str) -> Option<&'static str> {
    match os {
        "Debian GNU/Linux" | "Raspbian GNU/Linux" => Some(CMD_UPDATES_APT),
        "openSUSE Tumbleweed" | "openSUSE Leap" => Some(CMD_UPDATES_ZYPPER),
        "Fedora Linux" => Some(CMD_UPDATES_DNF),
        "Arch Linux" => Some(CMD_UPDATES_CHECKUPDATES),
        "OpenBSD" => Some(CMD_UPDATES_SYSPATCH),
        "FreeBSD" => Some(CMD_UPDATES_FREEBSD),
        _ => None,
    }
}

/// Filters raw update-command output into update descriptors, dispatching on
/// the OS identity the command was chosen for.
pub fn parse_updates(os: &str, lines: &[String]) -> Vec<String> {
    match os {
        "Debian GNU/Linux" | "Raspbian GNU/Linux" => parse_updates_apt(lines),
        "openSUSE Tumbleweed" | "openSUSE Leap" => parse_updates_zypper(lines),
        "Fedora Linux" => parse_updates_dnf(lines),
        "Arch Linux" => parse_updates_checkupdates(lines),
        "OpenBSD" | "FreeBSD" => parse_updates_bsd(lines),
        _ => Vec::new(),
    }
}

fn parse_updates_apt(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            APT_PAT.captures(line).map(|caps| {
                let fields: Vec<&str> = (1..=4)
                    .map(|i| caps.get(i).map(|m| m.as_str()).unwrap_or_default())
                    .collect();
                fields.join("\t")
            })
        })
        .collect()
}

fn parse_updates_zypper(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .skip(4)
        .filter_map(|line| {
            let pieces: Vec<&str> = ZYPPER_SEP.split(line.trim()).collect();
            if pieces.len() < 2 {
                return None;
            }
            Some(pieces[1..].join("\t"))
        })
        .collect()
}

fn parse_updates_dnf(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() == 3 {
                Some(fields.join("\t"))
            } else {
                None
            }
        })
        .collect()
}

fn parse_updates_checkupdates(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            CHECKUPDATES_PAT.captures(line.trim()).map(|caps| {
                let fields: Vec<&str> = (1..=3)
                    .map(|i| caps.get(i).map(|m| m.as_str()).unwrap_or_default())
                    .collect();
                fields.join("\t")
            })
        })
        .collect()
}

fn parse_updates_bsd(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|line| WORD_PAT.is_match(line))
        .map(|line| line.trim().to_string())
        .collect()
}

/// Extracts the 1/5/15-minute load triple from the first line of uptime(1)
/// output. Decimal commas are normalised to periods before parsing.
pub fn parse_load_avg(line: &str) -> Result<[f64; 3], ProbeError> {
    let caps = UPTIME_PAT
        .captures(line)
        .ok_or_else(|| ProbeError::Parse(format!("cannot parse uptime output {line:?}")))?;

    let mut load = [0.0f64; 3];
    for (idx, slot) in load.iter_mut().enumerate() {
        let raw = caps
            .get(idx + 1)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .replace(',', ".");
        *slot = raw
            .parse()
            .map_err(|_| ProbeError::Parse(format!("cannot parse load average {raw:?}")))?;
    }
    Ok(load)
}

/// Extracts the value of the NAME= line from /etc/os-release, stripped of
/// whitespace and quotes.
pub fn parse_os_release(lines: &[String]) -> Option<String> {
    lines.iter().find_map(|line| {
        line.strip_prefix("NAME=")
            .map(|rest| rest.trim().trim_matches('"').trim_matches('\'').to_string())
    })
}

/// Extracts the free percentage of the root filesystem from df(1) output.
/// The second line must carry a "NN%" token; free = 100 - used.
pub fn parse_disk_free(lines: &[String]) -> Result<i64, ProbeError> {
    let line = lines
        .get(1)
        .ok_or_else(|| ProbeError::Parse("df printed no data line".to_string()))?;
    let caps = DF_USED_PAT
        .captures(line)
        .ok_or_else(|| ProbeError::Parse(format!("no percentage in df output {line:?}")))?;
    let used: i64 = caps
        .get(1)
        .map(|m| m.as_str())
        .unwrap_or_default()
        .parse()
        .map_err(|_| ProbeError::Parse(format!("cannot parse used percentage in {line:?}")))?;
    Ok(100 - used)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn load_avg_debian_german_locale() {
        let line = "18:01:18  2 Tage  0:22 an,  2 Benutzer,  Durchschnittslast: 1,08, 0,98, 0,94";
        assert_eq!(parse_load_avg(line).unwrap(), [1.08, 0.98, 0.94]);
    }

    #[test]
    fn load_avg_bsd() {
        let line = "6:02PM  up 56 days,  5:16, 4 users, load averages: 0.00, 0.01, 0.00";
        assert_eq!(parse_load_avg(line).unwrap(), [0.0, 0.01, 0.0]);
    }

    #[test]
    fn load_avg_rejects_noise() {
        assert!(parse_load_avg("command not found").is_err());
        assert!(parse_load_avg("").is_err());
    }

    #[test]
    fn apt_update_lines() {
        let input = lines(&[
            "Listing... Done",
            "bash/stable 5.2.15-2+b2 amd64 [upgradable from: 5.2.15-2]",
            "vim/stable 2:9.0.1378-2 amd64 [upgradable from: 2:9.0.1378-1]",
            "",
        ]);
        let parsed = parse_updates("Debian GNU/Linux", &input);
        assert_eq!(
            parsed,
            vec![
                "bash\tstable\t5.2.15-2+b2\tamd64",
                "vim\tstable\t2:9.0.1378-2\tamd64",
            ]
        );
    }

    #[test]
    fn zypper_update_lines() {
        let input = lines(&[
            "Loading repository data...",
            "Reading installed packages...",
            "",
            "S | Repository | Name | Current Version | Available Version | Arch",
            "--+------------+------+-----------------+-------------------+-------",
            "v | Main Repo  | vim  | 9.0.1378-1.1    | 9.1.0000-1.1      | x86_64",
        ]);
        let parsed = parse_updates("openSUSE Tumbleweed", &input);
        assert_eq!(parsed, vec!["Main Repo\tvim\t9.0.1378-1.1\t9.1.0000-1.1\tx86_64"]);
    }

    #[test]
    fn dnf_update_lines() {
        let input = lines(&[
            "Last metadata expiration check: 0:33:12 ago on Mon Aug 11 10:00:00 2025.",
            "vim-enhanced.x86_64 2:9.1.1000-1.fc42 updates",
            "kernel.x86_64 6.10.3-200.fc42 updates",
        ]);
        let parsed = parse_updates("Fedora Linux", &input);
        assert_eq!(
            parsed,
            vec![
                "vim-enhanced.x86_64\t2:9.1.1000-1.fc42\tupdates",
                "kernel.x86_64\t6.10.3-200.fc42\tupdates",
            ]
        );
    }

    #[test]
    fn arch_update_lines() {
        let input = lines(&["linux 6.16.3.arch1-1 -> 6.16.4.arch1-1"]);
        let parsed = parse_updates("Arch Linux", &input);
        assert_eq!(parsed, vec!["linux\t6.16.3.arch1-1\t6.16.4.arch1-1"]);
    }

    #[test]
    fn bsd_update_lines() {
        let input = lines(&["", "  ", "syspatch-7.5-001_xserver", ""]);
        assert_eq!(
            parse_updates("OpenBSD", &input),
            vec!["syspatch-7.5-001_xserver"]
        );
    }

    #[test]
    fn unknown_os_yields_no_updates() {
        assert!(update_command("Plan 9").is_none());
        assert!(parse_updates("Plan 9", &lines(&["anything"])).is_empty());
    }

    #[test]
    fn exit_status_normalisation() {
        assert_eq!(
            normalize_exit_status(CMD_UPDATES_DNF, 100),
            ExitDisposition::Success
        );
        assert_eq!(
            normalize_exit_status(CMD_UPDATES_CHECKUPDATES, 2),
            ExitDisposition::Empty
        );
        assert_eq!(
            normalize_exit_status(CMD_UPDATES_FREEBSD, 2),
            ExitDisposition::Empty
        );
        assert_eq!(
            normalize_exit_status(CMD_UPDATES_APT, 1),
            ExitDisposition::Failure
        );
        assert_eq!(normalize_exit_status(CMD_UPTIME, 0), ExitDisposition::Success);
    }

    #[test]
    fn os_release_name() {
        let input = lines(&[
            "PRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"",
            "NAME=\"Debian GNU/Linux\"",
            "VERSION_ID=\"12\"",
        ]);
        assert_eq!(parse_os_release(&input).unwrap(), "Debian GNU/Linux");

        let unquoted = lines(&["NAME=Fedora Linux"]);
        assert_eq!(parse_os_release(&unquoted).unwrap(), "Fedora Linux");

        assert!(parse_os_release(&lines(&["ID=debian"])).is_none());
    }

    #[test]
    fn disk_free_from_df() {
        let input = lines(&[
            "Filesystem      Size  Used Avail Use% Mounted on",
            "/dev/sda2       233G  147G   74G  67% /",
        ]);
        assert_eq!(parse_disk_free(&input).unwrap(), 33);

        assert!(parse_disk_free(&lines(&["only one line"])).is_err());
        assert!(parse_disk_free(&lines(&["header", "no percent here"])).is_err());
    }
}
