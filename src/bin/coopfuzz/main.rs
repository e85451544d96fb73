mod cli;

use std::{ffi::OsString, path::PathBuf, process::exit, time::Duration};

use clap::Parser;
use libafl_bolts::Error;

use coopfuzz::{
    config::{Config, DumbMode, MSAN_ERROR_CODE},
    executor::{
        dumb::DumbExecutor,
        forkserver::{ForkserverExecutor, TargetSpawn},
        setup_coverage_shmem, TargetExecutor, TestcaseFile,
    },
    fuzzer::Campaign,
    persist::OutputDirs,
    signals, target,
};

fn main() {
    env_logger::init();

    let cli = match cli::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    let cfg = match resolve_config(cli) {
        Ok(cfg) => cfg,
        Err(msg) => {
            log::error!("{msg}");
            eprintln!("{msg}");
            exit(1);
        }
    };

    match run(cfg) {
        Ok(()) => exit(0),
        Err(Error::ShuttingDown) => exit(0),
        Err(err) => {
            log::error!("Fatal: {err}");
            eprintln!("Fatal: {err}");
            exit(2);
        }
    }
}

/// Fold the CLI and the environment into one validated [`Config`].
fn resolve_config(cli: cli::Cli) -> Result<Config, String> {
    let orig_cmdline = std::env::args().collect::<Vec<_>>().join(" ");

    let dumb_mode = if cli.dumb_mode {
        if std::env::var_os("AFL_DUMB_FORKSRV").is_some() {
            DumbMode::WithForkserver
        } else {
            DumbMode::Plain
        }
    } else {
        DumbMode::Off
    };
    let no_forkserver = std::env::var_os("AFL_NO_FORKSRV").is_some();

    if dumb_mode != DumbMode::Off {
        if cli.crash_mode {
            return Err("-C and -n are mutually exclusive".into());
        }
        if cli.qemu_mode {
            return Err("-Q and -n are mutually exclusive".into());
        }
    }
    if dumb_mode == DumbMode::WithForkserver && no_forkserver {
        return Err("AFL_DUMB_FORKSRV and AFL_NO_FORKSRV are mutually exclusive".into());
    }

    check_sanitizer_env()?;

    let force_deterministic = cli.main_id.is_some();
    let sync_id = cli.main_id.or(cli.secondary_id);

    // With a sync id, -o names the shared root and our own tree goes under it.
    let mut out_dir = cli.out_dir;
    let mut sync_dir = cli.sync_dir;
    let mut skip_deterministic = cli.skip_deterministic;
    if let Some(id) = &sync_id {
        if dumb_mode != DumbMode::Off {
            return Err("-S / -M and -n are mutually exclusive".into());
        }
        if skip_deterministic {
            return Err(if force_deterministic {
                "use -S instead of -M -d".into()
            } else {
                "-S already implies -d".into()
            });
        }
        cli::validate_sync_id(id)?;

        if sync_dir.is_none() {
            sync_dir = Some(out_dir.clone());
        }
        out_dir = out_dir.join(id);

        if !force_deterministic {
            skip_deterministic = true;
        }
    }

    let timeout = match &cli.timeout {
        Some(raw) => cli::parse_timeout(raw)?,
        None => cli::TimeoutArg {
            millis: coopfuzz::config::EXEC_TIMEOUT.as_millis() as u64,
            hard: false,
        },
    };
    let mem_limit_mb = match &cli.mem_limit {
        Some(raw) => cli::parse_mem_limit(raw)?,
        None => cli::default_mem_limit(cli.qemu_mode),
    };

    let target_path =
        target::find_binary(&cli.executable).map_err(|e| e.to_string())?;

    let banner = cli.banner.unwrap_or_else(|| {
        target_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "coopfuzz".to_string())
    });

    Ok(Config {
        out_dir,
        sync_dir,
        sync_id,
        force_deterministic,
        skip_deterministic,
        out_file: cli.input_file,
        exec_tmout: Duration::from_millis(timeout.millis),
        timeout_is_hard: timeout.hard,
        mem_limit_mb,
        qemu_mode: cli.qemu_mode,
        qemu_log: cli.qemu_log,
        dumb_mode,
        no_forkserver,
        no_var_check: std::env::var_os("AFL_NO_VAR_CHECK").is_some(),
        skip_bin_check: std::env::var_os("AFL_SKIP_BIN_CHECK").is_some(),
        crash_mode: cli.crash_mode,
        banner,
        in_bitmap: cli.in_bitmap,
        trim_cases: cli.trim_cases,
        peer_prefix: cli.peer_prefix,
        novel_peers: cli.novel_peers,
        sync_crashes: cli.sync_crashes,
        target_path,
        target_args: cli.arguments,
        orig_cmdline,
    })
}

/// Custom sanitizer environments must keep the options the outcome
/// classifier relies on.
fn check_sanitizer_env() -> Result<(), String> {
    if let Ok(asan) = std::env::var("ASAN_OPTIONS") {
        if !asan.contains("abort_on_error=1") {
            return Err("Custom ASAN_OPTIONS set without abort_on_error=1 - please fix!".into());
        }
    }
    if let Ok(msan) = std::env::var("MSAN_OPTIONS") {
        if !msan.contains(&format!("exit_code={MSAN_ERROR_CODE}")) {
            return Err(format!(
                "Custom MSAN_OPTIONS set without exit_code={MSAN_ERROR_CODE} - please fix!"
            ));
        }
    }
    Ok(())
}

fn run(cfg: Config) -> Result<(), Error> {
    let flags = signals::install()?;

    let traits = target::check_binary(&cfg)?;

    let output = OutputDirs::setup(&cfg)?;

    // The file the target reads; @@ and -f take it away from stdin.
    let input_path: PathBuf = cfg
        .out_file
        .clone()
        .unwrap_or_else(|| output.cur_input_path());
    let feeds_stdin = cfg.out_file.is_none() && !target::wants_input_file(&cfg.target_args);
    let testcase = TestcaseFile::create(&input_path, feeds_stdin)?;

    let spawn = build_spawn(&cfg, &output, &input_path)?;

    let map = setup_coverage_shmem(cfg.dumb_mode != DumbMode::Plain)?;

    let executor: Box<dyn TargetExecutor> = if cfg.uses_forkserver() {
        Box::new(ForkserverExecutor::start(
            &spawn,
            map,
            testcase,
            flags.stop.clone(),
            &cfg,
            traits.uses_asan,
        )?)
    } else {
        Box::new(DumbExecutor::new(
            spawn,
            map,
            testcase,
            flags.stop.clone(),
            traits.uses_asan,
        ))
    };

    log::info!(
        "Fuzzing {} ({}), syncing from {:?}",
        cfg.target_path.display(),
        cfg.banner,
        cfg.sync_dir
    );

    Campaign::new(cfg, executor, output, flags)?.run()
}

/// Assemble the child bring-up description, rewriting `@@` and switching to
/// the emulator in `-Q` mode.
fn build_spawn(
    cfg: &Config,
    output: &OutputDirs,
    input_path: &PathBuf,
) -> Result<TargetSpawn, Error> {
    let mut args: Vec<OsString> = target::substitute_input_path(&cfg.target_args, input_path);

    let program = if cfg.qemu_mode {
        let qemu = target::find_qemu()?;
        args.insert(0, cfg.target_path.clone().into_os_string());
        qemu
    } else {
        cfg.target_path.clone()
    };

    Ok(TargetSpawn {
        program,
        args,
        mem_limit_mb: cfg.mem_limit_mb,
        qemu_log: cfg.qemu_log.then(|| output.qemu_log_path()),
        aux_fd: output.cb_info_fd(),
    })
}
