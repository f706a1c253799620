use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use panfs::config::{ttl_from_secs, AuthArgs, Cli, Command, PanConfig, DEFAULT_CHUNK_SIZE};
use panfs::fs::fuse::PanFuse;
use panfs::fs::handles::HandleTable;
use panfs::fs::workers::WorkerPool;
use panfs::fs::PanFs;
use panfs::remote::token::TokenStore;
use panfs::remote::xpan::{api_agent, AppCredentials, XpanClient};
use panfs::remote::RemoteClient;

/// Write-end of the self-pipe used for signal notification.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(_sig: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

enum ShutdownAction {
    /// Second signal: force unmount.
    ForceUnmount,
    /// FUSE session ended on its own, or a first-signal probe unmount succeeded.
    ExternalUnmount,
}

/// Attempt a regular (non-forced) unmount. Returns true if the mount was
/// removed, i.e. it was not busy.
fn try_unmount(mountpoint: &Path) -> bool {
    ["fusermount", "umount"].iter().any(|cmd| {
        let mut command = std::process::Command::new(cmd);
        if *cmd == "fusermount" {
            command.arg("-u");
        }
        command
            .arg(mountpoint)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

/// Block until shutdown conditions are met. Implements two-phase ctrl-C:
/// - First signal when the mount is not busy: immediate clean unmount.
/// - First signal when the mount is busy: list open files and wait.
/// - Second signal: force unmount.
/// - FUSE session exits on its own: external unmount.
fn wait_for_shutdown(
    guard: &std::thread::JoinHandle<std::io::Result<()>>,
    file_handles: &HandleTable,
    mountpoint: &Path,
) -> ShutdownAction {
    let mut pipe_fds = [0 as libc::c_int; 2];
    assert_eq!(
        unsafe { libc::pipe(pipe_fds.as_mut_ptr()) },
        0,
        "failed to create signal pipe"
    );

    SIGNAL_PIPE.store(pipe_fds[1], Ordering::Relaxed);

    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
    }

    let mut first_signal_received = false;
    let mut poll_ticks: u32 = 0;

    let action = loop {
        let mut pfd = libc::pollfd {
            fd: pipe_fds[0],
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 200) };

        if ret > 0 {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut libc::c_void, 1);
            }

            if first_signal_received {
                eprintln!("panfs: force unmounting...");
                break ShutdownAction::ForceUnmount;
            }

            if guard.is_finished() {
                break ShutdownAction::ExternalUnmount;
            }

            if try_unmount(mountpoint) {
                eprintln!("panfs: unmounting (received signal)...");
                break ShutdownAction::ExternalUnmount;
            }

            first_signal_received = true;
            let open_files = file_handles.list_open();
            if open_files.is_empty() {
                eprintln!("panfs: mount is busy, processes are using the mountpoint");
            } else {
                eprintln!("panfs: mount is busy, {} open file(s):", open_files.len());
                let display_cap = 10;
                for info in open_files.iter().take(display_cap) {
                    let mode = if info.writable { "pending upload" } else { "read" };
                    eprintln!("  {}  ({})", info.path, mode);
                }
                if open_files.len() > display_cap {
                    eprintln!("  and {} more...", open_files.len() - display_cap);
                }
            }
            eprintln!("Close open files to unmount cleanly, or press ctrl-C again to force unmount.");
            continue;
        }

        if guard.is_finished() {
            break ShutdownAction::ExternalUnmount;
        }

        if first_signal_received {
            poll_ticks += 1;
            if poll_ticks % 5 == 0 && try_unmount(mountpoint) {
                eprintln!("panfs: all clear, unmounting...");
                break ShutdownAction::ExternalUnmount;
            }
        }
    };

    SIGNAL_PIPE.store(-1, Ordering::Relaxed);
    unsafe {
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }

    action
}

fn init_logging(log_file: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_name = log_file
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("panfs.log"));
    let file_appender = tracing_appender::rolling::never(log_dir, log_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false));
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
    guard
}

fn credentials(auth: &AuthArgs) -> AppCredentials {
    AppCredentials {
        client_id: auth.client_id.clone(),
        client_secret: auth.client_secret.clone(),
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            mountpoint,
            app_root,
            shadow_dir,
            dir_ttl_secs,
            block_size,
            read_timeout_secs,
            workers,
            sweep_interval_secs,
            log_file,
            auth,
        } => {
            if !mountpoint.exists() {
                if let Err(e) = std::fs::create_dir_all(&mountpoint) {
                    eprintln!("Error creating mountpoint {:?}: {}", mountpoint, e);
                    std::process::exit(1);
                }
            }

            let mountpoint = std::fs::canonicalize(&mountpoint).unwrap_or_else(|e| {
                eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
                std::process::exit(1);
            });

            if is_stale_fuse_mount(&mountpoint) {
                eprintln!(
                    "Error: {} is a stale FUSE mount (previous panfs session didn't clean up).\n\
                     Fix with:  fusermount -u {}",
                    mountpoint.display(),
                    mountpoint.display(),
                );
                std::process::exit(1);
            }

            let _log_guard = init_logging(&log_file);

            let config = PanConfig {
                mountpoint: mountpoint.clone(),
                app_root,
                shadow_dir,
                dir_ttl: ttl_from_secs(dir_ttl_secs),
                block_size,
                chunk_size: DEFAULT_CHUNK_SIZE,
                read_timeout: Duration::from_secs(read_timeout_secs),
                workers,
                sweep_interval: Duration::from_secs(sweep_interval_secs),
                log_file,
            };
            if let Err(e) = config.validate() {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }

            let store = TokenStore::new(auth.token_path());
            let client = match XpanClient::connect(credentials(&auth), store, config.read_timeout) {
                Ok(client) => client,
                Err(e) => {
                    error!("Cannot authorize: {}", e);
                    std::process::exit(1);
                }
            };
            let remote: Arc<dyn RemoteClient> = Arc::new(client);

            info!(
                "panfs starting: app_root={}, shadow_dir={}, mountpoint={}",
                config.app_root,
                config.shadow_dir.display(),
                mountpoint.display()
            );

            let sweep_interval = config.sweep_interval;
            let worker_count = config.workers;
            let fs = match PanFs::new(config, remote) {
                Ok(fs) => Arc::new(fs),
                Err(e) => {
                    error!("Failed to initialize: {}", e);
                    std::process::exit(1);
                }
            };

            let shutdown = Arc::new(AtomicBool::new(false));
            let sweeper_handle = match panfs::state::sweeper::start_sweeper_thread(
                Arc::clone(&fs.dir_cache),
                Arc::clone(&fs.downloads),
                sweep_interval,
                shutdown.clone(),
            ) {
                Ok(handle) => handle,
                Err(e) => {
                    error!("Failed to start sweeper: {}", e);
                    std::process::exit(1);
                }
            };

            let file_handles = Arc::clone(&fs.file_handles);
            let adapter = |fs: &Arc<PanFs>| match WorkerPool::new(worker_count) {
                Ok(pool) => PanFuse::new(Arc::clone(fs), pool),
                Err(e) => {
                    error!("Failed to start worker pool: {}", e);
                    std::process::exit(1);
                }
            };

            let mut fuse_config = fuser::Config::default();
            fuse_config.mount_options = vec![
                fuser::MountOption::FSName("panfs".to_string()),
                fuser::MountOption::AutoUnmount,
            ];
            fuse_config.acl = fuser::SessionACL::All;

            info!("Mounting panfs filesystem...");

            let session = match fuser::spawn_mount2(adapter(&fs), &mountpoint, &fuse_config) {
                Ok(session) => session,
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EPERM) || e.to_string().contains("allow_other") {
                        fuse_config.acl = fuser::SessionACL::Owner;
                        info!("Retrying mount without allow_other...");
                        match fuser::spawn_mount2(adapter(&fs), &mountpoint, &fuse_config) {
                            Ok(session) => session,
                            Err(e) => {
                                error!("Failed to mount: {}", e);
                                std::process::exit(1);
                            }
                        }
                    } else {
                        error!("Failed to mount: {}", e);
                        std::process::exit(1);
                    }
                }
            };

            info!("panfs mounted at {}", mountpoint.display());

            let action = wait_for_shutdown(&session.guard, &file_handles, &mountpoint);

            shutdown.store(true, Ordering::Relaxed);
            let _ = sweeper_handle.join();

            match action {
                ShutdownAction::ForceUnmount => {
                    if let Err(e) = session.umount_and_join() {
                        error!("Error during unmount, trying force unmount: {}", e);
                        let mp = mountpoint.to_string_lossy();
                        let _ = std::process::Command::new("umount").args(["-l", &*mp]).status();
                    }
                }
                ShutdownAction::ExternalUnmount => {
                    if let Err(e) = session.join() {
                        error!("Error joining FUSE session: {}", e);
                    }
                }
            }

            eprintln!("panfs: unmounted {}", mountpoint.display());
        }
        Command::Login { auth } => login(&auth),
        Command::Unmount { mountpoint } => {
            unmount(&mountpoint);
        }
    }
}

/// Interactive authorization-code flow; stores the resulting token.
fn login(auth: &AuthArgs) {
    if auth.client_id.is_empty() || auth.client_secret.is_empty() {
        eprintln!("Error: --client-id and --client-secret (or PANFS_CLIENT_ID/PANFS_CLIENT_SECRET) are required");
        std::process::exit(1);
    }
    let creds = credentials(auth);
    eprintln!("Open this URL in a browser and authorize panfs:\n\n  {}\n", creds.authorize_url());
    eprint!("Authorization code: ");

    let mut code = String::new();
    if let Err(e) = std::io::stdin().lock().read_line(&mut code) {
        eprintln!("Error reading code: {}", e);
        std::process::exit(1);
    }
    let code = code.trim();
    if code.is_empty() {
        eprintln!("Error: no authorization code entered");
        std::process::exit(1);
    }

    let agent = api_agent(Duration::from_secs(30));
    let store = TokenStore::new(auth.token_path());
    match creds.exchange_code(&agent, code).and_then(|token| store.store(&token)) {
        Ok(()) => eprintln!("Token stored in {}", store.path().display()),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Check if `path` is a stale FUSE mount: it appears in the mount table as a
/// fuse volume but is no longer functional (readdir fails).
fn is_stale_fuse_mount(path: &Path) -> bool {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();
    let is_fuse_mount = stdout
        .lines()
        .any(|line| line.contains(path_str.as_ref()) && line.contains("fuse"));
    if !is_fuse_mount {
        return false;
    }
    std::fs::read_dir(path).is_err()
}

fn unmount(mountpoint: &PathBuf) {
    let mountpoint = std::fs::canonicalize(mountpoint).unwrap_or_else(|e| {
        eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
        std::process::exit(1);
    });
    let mp = mountpoint.to_string_lossy();
    eprintln!("Unmounting {}...", mp);

    for args in [vec!["fusermount", "-u"], vec!["umount"]] {
        let output = std::process::Command::new(args[0])
            .args(&args[1..])
            .arg(&*mp)
            .output();

        if matches!(&output, Ok(o) if o.status.success()) {
            eprintln!("Successfully unmounted {}", mp);
            return;
        }

        if let Ok(ref o) = output {
            let stderr = String::from_utf8_lossy(&o.stderr);
            if stderr.contains("busy") {
                eprintln!(
                    "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                    mp
                );
                std::process::exit(1);
            }
        }
    }

    // Lazy unmount as last resort
    let status = std::process::Command::new("umount").args(["-l", &*mp]).status();

    if matches!(status, Ok(s) if s.success()) {
        eprintln!("Successfully unmounted {} (lazy)", mp);
        return;
    }

    eprintln!("Failed to unmount {}. Try: sudo umount -l {}", mp, mp);
    std::process::exit(1);
}
