//! Runtime configuration: the software device's knobs and the runner's
//! command line.
//!
//! Every software-device knob has an environment override so scenario
//! binaries can be steered without recompiling:
//!
//! | variable                    | meaning                              |
//! |-----------------------------|--------------------------------------|
//! | `GPU_CMD_KIT_CHIP`          | chip preset name                     |
//! | `GPU_CMD_KIT_LOCKUP_MS`     | stall time before a ring is reset    |
//! | `GPU_CMD_KIT_MAX_PENDING`   | unfinished jobs a ring accepts       |
//! | `GPU_CMD_KIT_BUDGET`        | shader instructions per dispatch     |
//! | `GPU_CMD_KIT_SCHED`         | `immediate` or `on-wait`             |
//! | `GPU_CMD_KIT_VRAM_MB`       | VRAM budget                          |
//! | `GPU_CMD_KIT_GTT_MB`        | GTT budget                           |
//! | `GPU_CMD_KIT_PROGRESS`      | `1` shows dispatch progress bars     |

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use getopts::Options;

use crate::device::IDS_FLAGS_TMZ;
use crate::error::{Error, Result};
use crate::family::{FAMILY_AI, FAMILY_NV, FAMILY_RV, FAMILY_SI, FAMILY_VI};

/// Chips the software device can impersonate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipPreset {
    Tahiti,
    Polaris11,
    Vega10,
    Arcturus,
    Renoir,
    Navi10,
}

/// Identification and IP versions reported for a preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipIdentity {
    pub asic_id: u32,
    pub family_id: u32,
    pub chip_external_rev: u32,
    pub chip_rev: u32,
    pub ids_flags: u64,
    pub gfx_version: (u32, u32),
    pub sdma_version: (u32, u32),
}

impl ChipPreset {
    pub const ALL: [ChipPreset; 6] = [
        ChipPreset::Tahiti,
        ChipPreset::Polaris11,
        ChipPreset::Vega10,
        ChipPreset::Arcturus,
        ChipPreset::Renoir,
        ChipPreset::Navi10,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ChipPreset::Tahiti => "tahiti",
            ChipPreset::Polaris11 => "polaris11",
            ChipPreset::Vega10 => "vega10",
            ChipPreset::Arcturus => "arcturus",
            ChipPreset::Renoir => "renoir",
            ChipPreset::Navi10 => "navi10",
        }
    }

    pub fn identity(&self) -> ChipIdentity {
        match self {
            ChipPreset::Tahiti => ChipIdentity {
                asic_id: 0x6798,
                family_id: FAMILY_SI,
                chip_external_rev: 0x05,
                chip_rev: 0,
                ids_flags: 0,
                gfx_version: (6, 0),
                sdma_version: (1, 0),
            },
            ChipPreset::Polaris11 => ChipIdentity {
                asic_id: 0x67ef,
                family_id: FAMILY_VI,
                chip_external_rev: 0x5a,
                chip_rev: 0,
                ids_flags: 0,
                gfx_version: (8, 0),
                sdma_version: (3, 0),
            },
            ChipPreset::Vega10 => ChipIdentity {
                asic_id: 0x687f,
                family_id: FAMILY_AI,
                chip_external_rev: 0x01,
                chip_rev: 0,
                ids_flags: 0,
                gfx_version: (9, 0),
                sdma_version: (4, 0),
            },
            ChipPreset::Arcturus => ChipIdentity {
                asic_id: 0x738c,
                family_id: FAMILY_AI,
                chip_external_rev: 0x32,
                chip_rev: 0,
                ids_flags: 0,
                gfx_version: (9, 4),
                sdma_version: (4, 2),
            },
            ChipPreset::Renoir => ChipIdentity {
                asic_id: 0x1636,
                family_id: FAMILY_RV,
                chip_external_rev: 0x91,
                chip_rev: 0,
                ids_flags: IDS_FLAGS_TMZ,
                gfx_version: (9, 3),
                sdma_version: (4, 1),
            },
            ChipPreset::Navi10 => ChipIdentity {
                asic_id: 0x731f,
                family_id: FAMILY_NV,
                chip_external_rev: 0x01,
                chip_rev: 0,
                ids_flags: 0,
                gfx_version: (10, 1),
                sdma_version: (5, 0),
            },
        }
    }
}

impl fmt::Display for ChipPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChipPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        ChipPreset::ALL
            .iter()
            .copied()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| Error::Config(format!("unknown chip preset {:?}", s)))
    }
}

/// When the software device executes submitted jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Jobs run as soon as they are submitted and their dependencies allow.
    Immediate,
    /// Jobs run only when a fence wait (or ring back-pressure) needs them.
    OnWait,
}

impl FromStr for SchedPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(SchedPolicy::Immediate),
            "on-wait" | "onwait" | "lazy" => Ok(SchedPolicy::OnWait),
            _ => Err(Error::Config(format!("unknown scheduling policy {:?}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub chip: ChipPreset,
    /// How long a ring may sit on an unsatisfied wait before it is reset.
    pub lockup_timeout: Duration,
    /// Unfinished jobs a single ring holds before submits block.
    pub max_pending_jobs: usize,
    /// Shader instructions a dispatch may retire before it counts as hung.
    pub instruction_budget: u64,
    pub sched_policy: SchedPolicy,
    pub vram_budget: u64,
    pub gtt_budget: u64,
    pub progress: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig::preset(ChipPreset::Vega10)
    }
}

const MIB: u64 = 1 << 20;

impl SimConfig {
    pub fn preset(chip: ChipPreset) -> Self {
        SimConfig {
            chip,
            lockup_timeout: Duration::from_millis(1000),
            max_pending_jobs: 32,
            instruction_budget: 1 << 22,
            sched_policy: SchedPolicy::Immediate,
            vram_budget: 1024 * MIB,
            gtt_budget: 1024 * MIB,
            progress: false,
        }
    }

    pub fn with_lockup_timeout(mut self, timeout: Duration) -> Self {
        self.lockup_timeout = timeout;
        self
    }

    pub fn with_sched_policy(mut self, policy: SchedPolicy) -> Self {
        self.sched_policy = policy;
        self
    }

    pub fn with_instruction_budget(mut self, budget: u64) -> Self {
        self.instruction_budget = budget;
        self
    }

    pub fn with_max_pending_jobs(mut self, jobs: usize) -> Self {
        self.max_pending_jobs = jobs;
        self
    }

    /// Defaults overridden by the `GPU_CMD_KIT_*` environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `get` returns for each
    /// `GPU_CMD_KIT_*` key.
    pub fn from_vars<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chip = match get("GPU_CMD_KIT_CHIP") {
            Some(name) => name.parse()?,
            None => ChipPreset::Vega10,
        };
        let mut config = SimConfig::preset(chip);
        if let Some(ms) = get("GPU_CMD_KIT_LOCKUP_MS") {
            config.lockup_timeout = Duration::from_millis(parse_number("GPU_CMD_KIT_LOCKUP_MS", &ms)?);
        }
        if let Some(n) = get("GPU_CMD_KIT_MAX_PENDING") {
            let jobs = parse_number("GPU_CMD_KIT_MAX_PENDING", &n)?;
            if jobs == 0 {
                return Err(Error::Config("GPU_CMD_KIT_MAX_PENDING must be at least 1".into()));
            }
            config.max_pending_jobs = jobs as usize;
        }
        if let Some(n) = get("GPU_CMD_KIT_BUDGET") {
            config.instruction_budget = parse_number("GPU_CMD_KIT_BUDGET", &n)?;
        }
        if let Some(policy) = get("GPU_CMD_KIT_SCHED") {
            config.sched_policy = policy.parse()?;
        }
        if let Some(mb) = get("GPU_CMD_KIT_VRAM_MB") {
            config.vram_budget = parse_number("GPU_CMD_KIT_VRAM_MB", &mb)? * MIB;
        }
        if let Some(mb) = get("GPU_CMD_KIT_GTT_MB") {
            config.gtt_budget = parse_number("GPU_CMD_KIT_GTT_MB", &mb)? * MIB;
        }
        if let Some(flag) = get("GPU_CMD_KIT_PROGRESS") {
            config.progress = matches!(flag.trim(), "1" | "true" | "yes" | "on");
        }
        Ok(config)
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| Error::Config(format!("{}={:?}: {}", key, value, e)))
}

/// Where the runner sends its submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelect {
    Sim,
    Render(PathBuf),
}

/// Parsed runner command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub device: DeviceSelect,
    pub chip: Option<ChipPreset>,
    /// Scenario name filters; empty runs everything.
    pub run: Vec<String>,
    pub list: bool,
    pub lockup_ms: Option<u64>,
    pub progress: bool,
    pub help: bool,
}

impl RunnerConfig {
    fn options() -> Options {
        let mut opts = Options::new();
        opts.optopt(
            "d",
            "device",
            "device to drive: `sim` or a render node path",
            "DEVICE",
        );
        opts.optopt("c", "chip", "chip preset for the software device", "CHIP");
        opts.optmulti("r", "run", "run scenarios whose name contains PATTERN", "PATTERN");
        opts.optflag("l", "list", "list scenarios and exit");
        opts.optopt("", "lockup-ms", "software device lockup timeout", "MS");
        opts.optflag("p", "progress", "show dispatch progress");
        opts.optflag("h", "help", "print this help");
        opts
    }

    /// Parses `args` without the program name.
    pub fn parse(args: &[String]) -> Result<Self> {
        let matches = Self::options()
            .parse(args)
            .map_err(|e| Error::Config(e.to_string()))?;

        let device = match matches.opt_str("device").as_deref() {
            None | Some("sim") => DeviceSelect::Sim,
            Some(path) => DeviceSelect::Render(PathBuf::from(path)),
        };
        let chip = matches.opt_str("chip").map(|c| c.parse()).transpose()?;
        let lockup_ms = matches
            .opt_str("lockup-ms")
            .map(|ms| parse_number("--lockup-ms", &ms))
            .transpose()?;
        let mut run = matches.opt_strs("run");
        run.extend(matches.free.iter().cloned());

        Ok(RunnerConfig {
            device,
            chip,
            run,
            list: matches.opt_present("list"),
            lockup_ms,
            progress: matches.opt_present("progress"),
            help: matches.opt_present("help"),
        })
    }

    pub fn usage(program: &str) -> String {
        let brief = format!("Usage: {} [options] [PATTERN...]", program);
        Self::options().usage(&brief)
    }

    /// Software-device configuration: environment first, then the command
    /// line on top.
    pub fn sim_config(&self) -> Result<SimConfig> {
        let mut config = SimConfig::from_env()?;
        if let Some(chip) = self.chip {
            config.chip = chip;
        }
        if let Some(ms) = self.lockup_ms {
            config.lockup_timeout = Duration::from_millis(ms);
        }
        config.progress |= self.progress;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn presets_parse_by_name() {
        for preset in ChipPreset::ALL {
            assert_eq!(preset.name().parse::<ChipPreset>().unwrap(), preset);
        }
        assert_eq!("  Navi10 ".parse::<ChipPreset>().unwrap(), ChipPreset::Navi10);
        assert!(matches!("fiji".parse::<ChipPreset>(), Err(Error::Config(_))));
        assert_eq!(ChipPreset::Renoir.identity().ids_flags & IDS_FLAGS_TMZ, IDS_FLAGS_TMZ);
    }

    #[test]
    fn environment_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("GPU_CMD_KIT_CHIP", "polaris11"),
            ("GPU_CMD_KIT_LOCKUP_MS", "25"),
            ("GPU_CMD_KIT_BUDGET", "0x1000"),
            ("GPU_CMD_KIT_SCHED", "on-wait"),
            ("GPU_CMD_KIT_GTT_MB", "8"),
        ]
        .into_iter()
        .collect();
        let config = SimConfig::from_vars(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.chip, ChipPreset::Polaris11);
        assert_eq!(config.lockup_timeout, Duration::from_millis(25));
        assert_eq!(config.instruction_budget, 0x1000);
        assert_eq!(config.sched_policy, SchedPolicy::OnWait);
        assert_eq!(config.gtt_budget, 8 << 20);
        assert_eq!(config.max_pending_jobs, SimConfig::default().max_pending_jobs);
    }

    #[test]
    fn bad_environment_is_a_config_error() {
        let bad = |k: &str| (k == "GPU_CMD_KIT_MAX_PENDING").then(|| "0".to_string());
        assert!(matches!(SimConfig::from_vars(bad), Err(Error::Config(_))));
        let junk = |k: &str| (k == "GPU_CMD_KIT_LOCKUP_MS").then(|| "soon".to_string());
        assert!(matches!(SimConfig::from_vars(junk), Err(Error::Config(_))));
    }

    #[test]
    fn runner_command_line() {
        let args: Vec<String> = ["--chip", "navi10", "-r", "dispatch", "deadlock", "--lockup-ms", "50"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = RunnerConfig::parse(&args).unwrap();
        assert_eq!(config.device, DeviceSelect::Sim);
        assert_eq!(config.chip, Some(ChipPreset::Navi10));
        assert_eq!(config.run, vec!["dispatch".to_string(), "deadlock".to_string()]);
        assert_eq!(config.lockup_ms, Some(50));
        assert!(!config.list);

        let node = RunnerConfig::parse(&["-d".into(), "/dev/dri/renderD128".into()]).unwrap();
        assert_eq!(node.device, DeviceSelect::Render(PathBuf::from("/dev/dri/renderD128")));
        assert!(RunnerConfig::parse(&["--bogus".into()]).is_err());
    }
}
