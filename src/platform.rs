//! Per-OS data: interpreter candidates, isolated environment layout and the
//! package-manager recipes used to install the interpreter when it is missing.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Macos,
    Linux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::Macos
        } else {
            Self::Linux
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Macos => "macos",
            Self::Linux => "linux",
        }
    }

    pub fn strategy(self) -> &'static PlatformStrategy {
        match self {
            Self::Windows => &WINDOWS,
            Self::Macos => &MACOS,
            Self::Linux => &LINUX,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistroFamily {
    Debian,
    Fedora,
    Arch,
    Unknown,
}

impl DistroFamily {
    /// Reads the `ID` and `ID_LIKE` keys of an os-release file.
    pub fn from_os_release(contents: &str) -> Self {
        let mut ids: Vec<String> = Vec::new();
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key != "ID" && key != "ID_LIKE" {
                continue;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            ids.extend(value.split_whitespace().map(|id| id.to_lowercase()));
        }

        for id in &ids {
            match id.as_str() {
                "ubuntu" | "debian" | "linuxmint" | "pop" => return Self::Debian,
                "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => return Self::Fedora,
                "arch" | "manjaro" | "endeavouros" => return Self::Arch,
                _ => {}
            }
        }
        Self::Unknown
    }
}

#[derive(Debug)]
pub struct InstallRecipe {
    pub label: &'static str,
    /// Linux recipes only apply to one distribution family.
    pub distro: Option<DistroFamily>,
    pub commands: &'static [&'static [&'static str]],
}

#[derive(Debug)]
pub struct PlatformStrategy {
    pub interpreter_candidates: &'static [&'static str],
    /// Bare command used by the best-effort fallback policy.
    pub interpreter_fallback: &'static str,
    pub package_manager_fallback: &'static str,
    pub venv_bin_dir: &'static str,
    pub venv_python: &'static str,
    pub venv_pip: &'static [&'static str],
    pub installers: &'static [InstallRecipe],
    pub manual_install_hint: &'static str,
}

impl PlatformStrategy {
    pub fn installers_for(&self, distro: DistroFamily) -> Vec<&InstallRecipe> {
        self.installers
            .iter()
            .filter(|recipe| recipe.distro.map_or(true, |family| family == distro))
            .collect()
    }
}

static WINDOWS: PlatformStrategy = PlatformStrategy {
    interpreter_candidates: &[
        "python",
        "python3",
        "py",
        r"C:\Python313\python.exe",
        r"C:\Python312\python.exe",
        r"C:\Python311\python.exe",
        r"C:\Python310\python.exe",
        r"C:\Python39\python.exe",
        r"C:\Users\%USERNAME%\AppData\Local\Programs\Python\Python313\python.exe",
        r"C:\Users\%USERNAME%\AppData\Local\Programs\Python\Python312\python.exe",
        r"C:\Users\%USERNAME%\AppData\Local\Programs\Python\Python311\python.exe",
        r"C:\Users\%USERNAME%\AppData\Local\Programs\Python\Python310\python.exe",
    ],
    interpreter_fallback: "python",
    package_manager_fallback: "pip",
    venv_bin_dir: "Scripts",
    venv_python: "python.exe",
    venv_pip: &["pip.exe", "pip3.exe"],
    installers: &[
        InstallRecipe {
            label: "winget",
            distro: None,
            commands: &[&[
                "winget",
                "install",
                "Python.Python.3.11",
                "--accept-package-agreements",
                "--accept-source-agreements",
            ]],
        },
        InstallRecipe {
            label: "chocolatey",
            distro: None,
            commands: &[&["choco", "install", "python311", "-y"]],
        },
    ],
    manual_install_hint: "Install Python 3.11+ manually from https://python.org",
};

static MACOS: PlatformStrategy = PlatformStrategy {
    interpreter_candidates: &[
        "python3",
        "python",
        "/opt/homebrew/bin/python3",
        "/usr/local/bin/python3",
        "/usr/bin/python3",
        "/opt/anaconda3/bin/python3",
        "/opt/miniconda3/bin/python3",
    ],
    interpreter_fallback: "python3",
    package_manager_fallback: "pip3",
    venv_bin_dir: "bin",
    venv_python: "python3",
    venv_pip: &["pip3", "pip"],
    installers: &[InstallRecipe {
        label: "homebrew",
        distro: None,
        commands: &[&["brew", "install", "python@3.11"]],
    }],
    manual_install_hint:
        "Install Python 3.11+ manually from https://python.org or install Homebrew from https://brew.sh",
};

static LINUX: PlatformStrategy = PlatformStrategy {
    interpreter_candidates: &[
        "python3",
        "python",
        "/usr/bin/python3",
        "/usr/local/bin/python3",
        "/opt/python3/bin/python3",
    ],
    interpreter_fallback: "python3",
    package_manager_fallback: "pip3",
    venv_bin_dir: "bin",
    venv_python: "python3",
    venv_pip: &["pip3", "pip"],
    installers: &[
        InstallRecipe {
            label: "apt",
            distro: Some(DistroFamily::Debian),
            commands: &[
                &["sudo", "-n", "apt-get", "update"],
                &[
                    "sudo",
                    "-n",
                    "apt-get",
                    "install",
                    "-y",
                    "python3",
                    "python3-pip",
                    "python3-venv",
                ],
            ],
        },
        InstallRecipe {
            label: "dnf",
            distro: Some(DistroFamily::Fedora),
            commands: &[&["sudo", "-n", "dnf", "install", "-y", "python3", "python3-pip"]],
        },
        InstallRecipe {
            label: "pacman",
            distro: Some(DistroFamily::Arch),
            commands: &[&["sudo", "-n", "pacman", "-S", "--noconfirm", "python", "python-pip"]],
        },
    ],
    manual_install_hint:
        "Install python3, python3-pip and python3-venv with your distribution's package manager",
};

/// Paths inside an isolated dependency environment.
#[derive(Debug, Clone)]
pub struct EnvLayout {
    root: PathBuf,
    platform: Platform,
}

impl EnvLayout {
    pub fn new(root: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            root: root.into(),
            platform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn python(&self) -> PathBuf {
        let strategy = self.platform.strategy();
        self.root
            .join(strategy.venv_bin_dir)
            .join(strategy.venv_python)
    }

    pub fn pip_candidates(&self) -> Vec<String> {
        let strategy = self.platform.strategy();
        strategy
            .venv_pip
            .iter()
            .map(|name| {
                self.root
                    .join(strategy.venv_bin_dir)
                    .join(name)
                    .to_string_lossy()
                    .to_string()
            })
            .collect()
    }
}

fn user_home_dir() -> Option<PathBuf> {
    for key in ["HOME", "USERPROFILE"] {
        if let Ok(raw) = env::var(key) {
            let clean = raw.trim();
            if !clean.is_empty() {
                return Some(PathBuf::from(clean));
            }
        }
    }
    None
}

/// Expands `%USERNAME%` and a leading `~/`. Returns `None` when a placeholder
/// cannot be filled so the candidate is skipped instead of probed half-built.
pub fn expand_candidate(raw: &str) -> Option<String> {
    let mut text = raw.trim().to_string();
    if text.is_empty() {
        return None;
    }
    if text.contains("%USERNAME%") {
        let user = env::var("USERNAME").ok().filter(|u| !u.trim().is_empty())?;
        text = text.replace("%USERNAME%", user.trim());
    }
    if let Some(rest) = text.strip_prefix("~/") {
        let home = user_home_dir()?;
        text = home.join(rest).to_string_lossy().to_string();
    }
    Some(text)
}

/// Expanded, de-duplicated candidate list with `explicit` (if any) first.
pub fn interpreter_candidates(platform: Platform, explicit: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let explicit = explicit.map(str::trim).filter(|value| !value.is_empty());
    let raw = explicit
        .into_iter()
        .chain(platform.strategy().interpreter_candidates.iter().copied());
    for candidate in raw {
        if let Some(expanded) = expand_candidate(candidate) {
            if !out.contains(&expanded) {
                out.push(expanded);
            }
        }
    }
    out
}
