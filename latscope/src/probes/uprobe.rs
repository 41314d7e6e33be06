//! aya uprobe backend for the attachment manager

use anyhow::Context;
use aya::{
    programs::{uprobe::UProbeLinkId, UProbe},
    Ebpf,
};
use latscope_common::{ENTRY_PROGRAM, EXIT_PROGRAM, RETURN_PROGRAM};
use log::info;
use std::path::{Path, PathBuf};

use super::{ExitPlan, ProbeBackend};
use crate::domain::{AttachError, Pid, ProbePoint};

/// Verify and load the programs `plan` needs into the kernel
///
/// # Errors
/// Returns an error if a program is missing from the object or the verifier
/// rejects it
pub fn load_programs(bpf: &mut Ebpf, plan: &ExitPlan) -> Result<(), AttachError> {
    let exit_program = match plan {
        ExitPlan::Offsets(_) => EXIT_PROGRAM,
        ExitPlan::ReturnProbe => RETURN_PROGRAM,
    };

    for name in [ENTRY_PROGRAM, exit_program] {
        let program: &mut UProbe = bpf
            .program_mut(name)
            .ok_or_else(|| AttachError::ProgramNotFound(name.to_string()))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| AttachError::Load {
                program: name.to_string(),
                cause: e.to_string(),
            })?;
        program
            .load()
            .map_err(|e| AttachError::Load { program: name.to_string(), cause: e.to_string() })?;
        info!("✓ Loaded {name}");
    }
    Ok(())
}

/// Attaches uprobes on one binary, filtered to one process
///
/// Owns the loaded [`Ebpf`] object; dropping the backend unloads the programs.
pub struct UprobeBackend {
    bpf: Ebpf,
    target: PathBuf,
    pid: Pid,
}

impl UprobeBackend {
    #[must_use]
    pub fn new(bpf: Ebpf, target: &Path, pid: Pid) -> Self {
        Self { bpf, target: target.to_path_buf(), pid }
    }

    fn program(&mut self, point: ProbePoint) -> anyhow::Result<&mut UProbe> {
        let name = match point {
            ProbePoint::Entry => ENTRY_PROGRAM,
            ProbePoint::Exit { .. } => EXIT_PROGRAM,
            ProbePoint::Return => RETURN_PROGRAM,
        };
        let program: &mut UProbe = self
            .bpf
            .program_mut(name)
            .with_context(|| format!("{name} program not found"))?
            .try_into()?;
        Ok(program)
    }
}

impl ProbeBackend for UprobeBackend {
    type Token = UProbeLinkId;
    type Error = anyhow::Error;

    fn attach(&mut self, symbol: &str, point: ProbePoint) -> anyhow::Result<UProbeLinkId> {
        let target = self.target.clone();
        let pid = self.pid.0;
        let program = self.program(point)?;
        let link = program
            .attach(Some(symbol), point.offset(), &target, Some(pid))
            .with_context(|| format!("uprobe {symbol}+{:#x} in {}", point.offset(), target.display()))?;
        Ok(link)
    }

    fn detach(&mut self, point: ProbePoint, token: UProbeLinkId) -> anyhow::Result<()> {
        self.program(point)?.detach(token)?;
        Ok(())
    }
}
