//! Real-time scheduling for the server process: keeps step pulses from
//! being delayed by page faults or ordinary time-sharing.
//!
//! Linux: mlockall, SCHED_FIFO and single-CPU affinity. macOS: mlockall only.
//! Every failure is a warning; the server still runs without RT guarantees.

use crate::cli::RtLock;

#[cfg(unix)]
fn mlockall(lock: RtLock) -> std::io::Result<()> {
    use libc::{MCL_CURRENT, MCL_FUTURE};
    let flags = match lock {
        RtLock::None => return Ok(()),
        RtLock::Current => MCL_CURRENT,
        RtLock::All => MCL_CURRENT | MCL_FUTURE,
    };
    // SAFETY: mlockall takes no pointers.
    if unsafe { libc::mlockall(flags) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn memlock_hint() -> String {
    let mut rlim = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    // SAFETY: getrlimit writes a full rlimit on success.
    let limit = unsafe {
        if libc::getrlimit(libc::RLIMIT_MEMLOCK, rlim.as_mut_ptr()) != 0 {
            return "needs CAP_IPC_LOCK and a larger 'ulimit -l'".into();
        }
        rlim.assume_init().rlim_cur
    };
    if limit == libc::RLIM_INFINITY {
        "memlock limit: unlimited".into()
    } else {
        format!(
            "memlock limit {} KiB; needs CAP_IPC_LOCK and a larger 'ulimit -l'",
            limit / 1024
        )
    }
}

#[cfg(target_os = "linux")]
fn lock_memory(lock: RtLock) -> eyre::Result<()> {
    match mlockall(lock) {
        Ok(()) => Ok(()),
        Err(e) if lock == RtLock::All && matches!(e.raw_os_error(), Some(libc::EPERM | libc::ENOMEM)) => {
            mlockall(RtLock::Current).map_err(|e2| {
                eyre::eyre!("mlockall(all) failed: {e}; mlockall(current) failed: {e2}; {}", memlock_hint())
            })?;
            tracing::warn!(error = %e, "mlockall(all) refused, locked current pages only");
            Ok(())
        }
        Err(e) => Err(eyre::eyre!("mlockall failed: {e}; {}", memlock_hint())),
    }
}

#[cfg(target_os = "linux")]
fn fifo_priority(prio: Option<i32>) -> eyre::Result<i32> {
    // SAFETY: plain integer syscalls.
    let (min, max) = unsafe {
        (
            libc::sched_get_priority_min(libc::SCHED_FIFO),
            libc::sched_get_priority_max(libc::SCHED_FIFO),
        )
    };
    let (min, max) = if min < 0 || max < 0 { (1, 99) } else { (min, max) };
    let prio = prio.unwrap_or(max).clamp(min, max);
    let param = libc::sched_param {
        sched_priority: prio,
    };
    // SAFETY: `param` outlives the call.
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        let err = std::io::Error::last_os_error();
        // SAFETY: geteuid cannot fail.
        let euid = unsafe { libc::geteuid() };
        eyre::bail!(
            "sched_setscheduler(SCHED_FIFO, {prio}) failed: {err} (euid {euid}); grant CAP_SYS_NICE: 'sudo setcap cap_sys_nice=ep <binary>'"
        );
    }
    Ok(prio)
}

#[cfg(target_os = "linux")]
fn pin_cpu(cpu: usize) -> eyre::Result<()> {
    let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
    if cpu >= capacity {
        eyre::bail!("CPU {cpu} exceeds cpu_set_t capacity {capacity}");
    }
    // SAFETY: cpu_set_t is plain data; the CPU_* helpers stay within `capacity`.
    unsafe {
        let mut allowed: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut allowed) != 0 {
            eyre::bail!("sched_getaffinity: {}", std::io::Error::last_os_error());
        }
        if !libc::CPU_ISSET(cpu, &allowed) {
            eyre::bail!("CPU {cpu} is not in the current affinity mask");
        }
        let mut wanted: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut wanted);
        libc::CPU_SET(cpu, &mut wanted);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &wanted) != 0 {
            eyre::bail!("sched_setaffinity: {}", std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Apply RT settings once per process. Threads spawned afterwards inherit
/// the scheduling policy, so call this before the controller starts.
pub fn setup_rt_once(rt: bool, prio: Option<i32>, lock: RtLock, cpu: Option<usize>) {
    use std::sync::OnceLock;
    static RT_ONCE: OnceLock<()> = OnceLock::new();
    if !rt {
        return;
    }
    RT_ONCE.get_or_init(|| apply(prio, lock, cpu));
}

#[cfg(target_os = "linux")]
fn apply(prio: Option<i32>, lock: RtLock, cpu: Option<usize>) {
    match lock_memory(lock) {
        Ok(()) => tracing::info!(?lock, "RT memory lock applied"),
        Err(e) => tracing::warn!(error = %e, "RT memory lock not applied"),
    }
    match fifo_priority(prio) {
        Ok(p) => tracing::info!(priority = p, "RT SCHED_FIFO applied"),
        Err(e) => tracing::warn!(error = %e, "RT priority not applied"),
    }
    let cpu = cpu.unwrap_or(0);
    match pin_cpu(cpu) {
        Ok(()) => tracing::info!(cpu, "RT affinity applied"),
        Err(e) => tracing::warn!(error = %e, "RT affinity not applied"),
    }
}

#[cfg(target_os = "macos")]
fn apply(_prio: Option<i32>, lock: RtLock, _cpu: Option<usize>) {
    match mlockall(lock) {
        Ok(()) => tracing::info!(?lock, "RT memory lock applied"),
        Err(e) => tracing::warn!(error = %e, "RT memory lock not applied"),
    }
    tracing::warn!("macOS has no SCHED_FIFO or affinity control; only mlockall applied");
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn apply(_prio: Option<i32>, _lock: RtLock, _cpu: Option<usize>) {
    tracing::warn!("real-time mode is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_rt_is_a_no_op() {
        setup_rt_once(false, Some(10), RtLock::All, Some(0));
    }

    #[cfg(unix)]
    #[test]
    fn no_memory_lock_always_succeeds() {
        assert!(mlockall(RtLock::None).is_ok());
    }
}
