/// Child-side setup between fork and exec
///
/// Everything is computed in the parent by `PreExecPlan::build`. `apply` runs
/// in the forked child, so it only issues raw syscalls over pre-built buffers:
/// no allocation, no locks, no logging.
///
/// Fixed order in the child:
/// 1. setsid() so the whole script tree shares one killable process group
/// 2. PR_SET_PDEATHSIG so the script dies with the analyzer
/// 3. inherited descriptors marked close-on-exec
/// 4. join the run's memory cgroup, when there is one
/// 5. unshare(user | mount | net), then setgroups/uid_map/gid_map
/// 6. mount propagation made private; the run directory (and the runtime's
///    program directory, if hidden) pinned by O_PATH descriptors
/// 7. masked host directories covered by empty tmpfs; pinned directories
///    recreated inside the masks and bound back in
/// 8. masks, then every host mount point, remounted read-only
/// 9. rlimits, clamped to the hard limits the parent holds
use crate::config::loader::AnalyzerConfig;
use crate::config::types::{ResourceLimits, Result, ScriptboxError};
use nix::sched::{unshare, CloneFlags};
use std::ffi::{CString, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
const OVERFLOW_ID: u32 = 65534;
const MOUNTINFO: &str = "/proc/self/mountinfo";
const MASK_FLAGS: libc::c_ulong = libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC;

/// Isolation report name of the per-run memory cgroup
pub const CGROUP_CONTROL: &str = "cgroup_memory";

#[derive(Debug, Clone, Copy)]
struct RlimitSpec {
    name: &'static str,
    resource: libc::__rlimit_resource_t,
    value: libc::rlim_t,
}

/// A host directory that must stay reachable at its own path
#[derive(Debug, PartialEq)]
struct Exposure {
    target: CString,
    /// Directories to create inside the covering mask, outermost first
    recreate: Vec<CString>,
    /// `Some(locked flags)` when the bind must be read-only
    read_only: Option<libc::c_ulong>,
}

#[derive(Debug)]
struct NamespacePlan {
    setgroups_path: CString,
    uid_map_path: CString,
    gid_map_path: CString,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    root: CString,
    tmpfs: CString,
    current_dir: CString,
    workspace: Exposure,
    program_dir: Option<Exposure>,
    masks: Vec<CString>,
    /// Host mount points outside the masks, with the flags a remount must keep
    read_only: Vec<(CString, libc::c_ulong)>,
}

/// Pre-built child setup for one execution
#[derive(Debug)]
pub struct PreExecPlan {
    rlimits: Vec<RlimitSpec>,
    cgroup_procs: Option<CString>,
    namespaces: Option<NamespacePlan>,
}

fn cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        ScriptboxError::Config(format!("path contains a NUL byte: {}", path.display()))
    })
}

fn literal(s: &str) -> CString {
    // Literals below never contain NUL
    CString::new(s).unwrap_or_default()
}

/// Clamp `wanted` to the hard limit this process currently holds
fn clamp_to_hard(resource: libc::__rlimit_resource_t, wanted: u64) -> libc::rlim_t {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(resource, &mut current) };
    let wanted = wanted as libc::rlim_t;
    if rc != 0 || current.rlim_max == libc::RLIM_INFINITY {
        return wanted;
    }
    wanted.min(current.rlim_max)
}

/// Mount flags of the mount holding `path` that an unprivileged remount must carry over
fn locked_flags(path: &CString) -> libc::c_ulong {
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::zeroed();
    let rc = unsafe { libc::statvfs(path.as_ptr(), st.as_mut_ptr()) };
    if rc != 0 {
        log::debug!("statvfs({:?}) failed: {}", path, io::Error::last_os_error());
        return 0;
    }
    let st = unsafe { st.assume_init() };
    let pairs = [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ];
    pairs
        .iter()
        .filter(|(st_flag, _)| st.f_flag & *st_flag != 0)
        .fold(0, |acc, (_, ms_flag)| acc | *ms_flag)
}

fn id_map(outside: u32) -> Vec<u8> {
    let inside = if outside == 0 { OVERFLOW_ID } else { outside };
    format!("{} {} 1\n", inside, outside).into_bytes()
}

/// Undo the octal escapes (`\040` and friends) mountinfo uses for whitespace
fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        });
        match octal {
            Some(digits) => {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                out.push(value as u8);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Mount points listed in a mountinfo table, in table order, without duplicates
fn mount_points(mountinfo: &str) -> Vec<PathBuf> {
    let mut points: Vec<PathBuf> = Vec::new();
    for line in mountinfo.lines() {
        let Some(raw) = line.split(' ').nth(4) else {
            continue;
        };
        let point = unescape_mount_path(raw);
        if !points.contains(&point) {
            points.push(point);
        }
    }
    points
}

/// Masks that exist as directories, minus any already covered by another mask
fn effective_masks(configured: &[PathBuf]) -> Vec<PathBuf> {
    let existing: Vec<&PathBuf> = configured.iter().filter(|p| p.is_dir()).collect();
    let mut masks: Vec<PathBuf> = Vec::new();
    for path in &existing {
        let covered = existing
            .iter()
            .any(|other| other != path && path.starts_with(other));
        if !covered && !masks.contains(*path) {
            masks.push((*path).clone());
        }
    }
    masks
}

/// Plan how `dir` stays reachable once `masks` are mounted
fn exposure(dir: &Path, masks: &[PathBuf], read_only: bool) -> Result<Exposure> {
    let mut recreate = Vec::new();
    if let Some(mask) = masks.iter().find(|mask| dir.starts_with(mask)) {
        if let Ok(relative) = dir.strip_prefix(mask) {
            let mut current = mask.clone();
            for component in relative.components() {
                current.push(component);
                recreate.push(cstring(&current)?);
            }
        }
    }
    let target = cstring(dir)?;
    let read_only = read_only.then(|| locked_flags(&target));
    Ok(Exposure {
        target,
        recreate,
        read_only,
    })
}

impl PreExecPlan {
    /// `program` is the executable the runtime launches. Its directory is bound
    /// back read-only when a mask would hide it.
    pub fn build(
        limits: &ResourceLimits,
        config: &AnalyzerConfig,
        workspace: &Path,
        program: &Path,
        with_namespaces: bool,
        cgroup_procs: Option<&Path>,
    ) -> Result<Self> {
        let cpu_seconds = limits.max_wall_time.as_secs_f64().ceil() as u64 + 1;
        let specs: [(&'static str, libc::__rlimit_resource_t, u64); 6] = [
            ("rlimit_as", libc::RLIMIT_AS, limits.max_memory),
            ("rlimit_cpu", libc::RLIMIT_CPU, cpu_seconds),
            ("rlimit_fsize", libc::RLIMIT_FSIZE, limits.max_output_size),
            ("rlimit_core", libc::RLIMIT_CORE, 0),
            ("rlimit_nofile", libc::RLIMIT_NOFILE, config.max_open_files),
            ("rlimit_nproc", libc::RLIMIT_NPROC, config.max_processes),
        ];
        let rlimits = specs
            .iter()
            .map(|&(name, resource, wanted)| {
                let value = clamp_to_hard(resource, wanted);
                if value < wanted as libc::rlim_t {
                    log::warn!(
                        "{} lowered to hard limit {} (wanted {})",
                        name,
                        value,
                        wanted
                    );
                }
                RlimitSpec {
                    name,
                    resource,
                    value,
                }
            })
            .collect();

        let namespaces = if with_namespaces {
            Some(NamespacePlan::build(config, workspace, program)?)
        } else {
            None
        };

        Ok(Self {
            rlimits,
            cgroup_procs: cgroup_procs.map(cstring).transpose()?,
            namespaces,
        })
    }

    pub fn has_namespaces(&self) -> bool {
        self.namespaces.is_some()
    }

    pub fn has_cgroup(&self) -> bool {
        self.cgroup_procs.is_some()
    }

    /// Controls this plan puts in place when `apply` succeeds
    pub fn applied_controls(&self) -> Vec<String> {
        let mut controls = vec!["process_group".to_string()];
        controls.extend(self.rlimits.iter().map(|r| r.name.to_string()));
        if self.cgroup_procs.is_some() {
            controls.push(CGROUP_CONTROL.to_string());
        }
        if self.namespaces.is_some() {
            controls.extend(Self::namespace_controls());
        }
        controls
    }

    /// Controls that only exist with namespace isolation
    pub fn namespace_controls() -> Vec<String> {
        [
            "user_namespace",
            "mount_namespace",
            "network_namespace",
            "read_only_mounts",
            "masked_paths",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    /// Run in the child after fork. Async-signal-safe.
    pub fn apply(&self) -> io::Result<()> {
        check(unsafe { libc::setsid() })?;
        check(unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) })?;
        // Best effort; ENOSYS on kernels without close_range
        unsafe {
            libc::syscall(libc::SYS_close_range, 3 as libc::c_uint, libc::c_uint::MAX, CLOSE_RANGE_CLOEXEC);
            libc::umask(0o077);
        }

        // Before unshare: cgroup.procs checks permissions against the host view
        if let Some(procs) = &self.cgroup_procs {
            write_proc_file(procs, b"0")?;
        }

        if let Some(ns) = &self.namespaces {
            ns.apply()?;
        }

        for spec in &self.rlimits {
            let limit = libc::rlimit {
                rlim_cur: spec.value,
                rlim_max: spec.value,
            };
            check(unsafe { libc::setrlimit(spec.resource, &limit) })?;
        }
        Ok(())
    }
}

impl NamespacePlan {
    fn build(config: &AnalyzerConfig, workspace: &Path, program: &Path) -> Result<Self> {
        let masks = effective_masks(&config.masked_paths);

        let program_dir = program
            .parent()
            .filter(|dir| dir.is_absolute())
            .filter(|dir| masks.iter().any(|mask| dir.starts_with(mask)))
            .map(|dir| exposure(dir, &masks, true))
            .transpose()?;

        let mountinfo = std::fs::read_to_string(MOUNTINFO).unwrap_or_else(|e| {
            log::warn!("Failed to read {}: {}; only / is remounted read-only", MOUNTINFO, e);
            String::new()
        });
        let mut points = mount_points(&mountinfo);
        if !points.iter().any(|p| p == Path::new("/")) {
            points.insert(0, PathBuf::from("/"));
        }
        let mut read_only = Vec::new();
        for point in &points {
            if masks.iter().any(|mask| point.starts_with(mask)) || point.starts_with(workspace) {
                continue;
            }
            let target = cstring(point)?;
            let flags = locked_flags(&target);
            read_only.push((target, flags));
        }

        Ok(Self {
            setgroups_path: literal("/proc/self/setgroups"),
            uid_map_path: literal("/proc/self/uid_map"),
            gid_map_path: literal("/proc/self/gid_map"),
            uid_map: id_map(unsafe { libc::geteuid() }),
            gid_map: id_map(unsafe { libc::getegid() }),
            root: literal("/"),
            tmpfs: literal("tmpfs"),
            current_dir: literal("."),
            workspace: exposure(workspace, &masks, false)?,
            program_dir,
            masks: masks.iter().map(|m| cstring(m)).collect::<Result<Vec<_>>>()?,
            read_only,
        })
    }

    fn apply(&self) -> io::Result<()> {
        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

        match write_proc_file(&self.setgroups_path, b"deny") {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            other => other?,
        }
        write_proc_file(&self.uid_map_path, &self.uid_map)?;
        write_proc_file(&self.gid_map_path, &self.gid_map)?;

        mount(None, &self.root, None, libc::MS_REC | libc::MS_PRIVATE)?;

        // Opened after unshare so the descriptors refer to this namespace's mounts
        let workspace_fd = open_path(&self.workspace.target)?;
        let program_fd = match &self.program_dir {
            Some(dir) => Some(open_path(&dir.target)?),
            None => None,
        };

        for mask in &self.masks {
            mount(Some(&self.tmpfs), mask, Some(&self.tmpfs), MASK_FLAGS)?;
        }

        self.expose(&self.workspace, workspace_fd)?;
        if let (Some(dir), Some(fd)) = (&self.program_dir, program_fd) {
            self.expose(dir, fd)?;
        }

        for mask in &self.masks {
            mount(
                None,
                mask,
                None,
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | MASK_FLAGS,
            )?;
        }

        for (target, flags) in &self.read_only {
            match mount(
                None,
                target,
                None,
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | flags,
            ) {
                // Shadowed by a later mount or unreachable for the script as well
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::EINVAL)
                    ) => {}
                other => other?,
            }
        }

        check(unsafe { libc::chdir(self.workspace.target.as_ptr()) }).map(|_| ())
    }

    /// Bind the pinned directory `fd` back at its own path
    fn expose(&self, exposure: &Exposure, fd: libc::c_int) -> io::Result<()> {
        for dir in &exposure.recreate {
            if unsafe { libc::mkdir(dir.as_ptr(), 0o700) } < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(err);
                }
            }
        }
        check(unsafe { libc::fchdir(fd) })?;
        unsafe {
            libc::close(fd);
        }
        mount(
            Some(&self.current_dir),
            &exposure.target,
            None,
            libc::MS_BIND | libc::MS_REC,
        )?;
        if let Some(flags) = exposure.read_only {
            mount(
                None,
                &exposure.target,
                None,
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | flags,
            )?;
        }
        Ok(())
    }
}

fn open_path(path: &CString) -> io::Result<libc::c_int> {
    check(unsafe {
        libc::open(
            path.as_ptr(),
            libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    })
}

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc)
}

fn mount(
    source: Option<&CString>,
    target: &CString,
    fstype: Option<&CString>,
    flags: libc::c_ulong,
) -> io::Result<()> {
    let rc = unsafe {
        libc::mount(
            source.map_or(std::ptr::null(), |s| s.as_ptr()),
            target.as_ptr(),
            fstype.map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            std::ptr::null(),
        )
    };
    check(rc).map(|_| ())
}

fn write_proc_file(path: &CString, content: &[u8]) -> io::Result<()> {
    let fd = check(unsafe { libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) })?;
    let written = unsafe { libc::write(fd, content.as_ptr().cast(), content.len()) };
    let err = io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    if written < 0 {
        return Err(err);
    }
    if written as usize != content.len() {
        return Err(io::Error::from_raw_os_error(libc::EIO));
    }
    Ok(())
}
