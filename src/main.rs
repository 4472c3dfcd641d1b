#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use ddt_manager::backup::{BackupInfo, BackupStore};
use ddt_manager::diagnostics::diagnostic_page;
use ddt_manager::launcher::is_server_output;
use ddt_manager::secrets::{collect_server_secrets, KeyringSecretStore};
use ddt_manager::{
    ServerEndpoint, Supervisor, SupervisorConfig, SupervisorError, SupervisorStatus, SystemRunner,
};
use log::{error, info, LevelFilter};
use tauri::{AppHandle, Emitter, Manager, RunEvent, WindowEvent};
use tauri_plugin_log::{RotationStrategy, Target, TargetKind};

const CONFIG_FILE: &str = "supervisor.json";
const DATABASE_FILE: &str = "db.sqlite3";
const BACKUP_RETENTION_DAYS: u64 = 30;
const MAIN_WINDOW: &str = "main";
const STATUS_EVENT: &str = "server-status";
/// `tauri-plugin-log` appends `.log` to the file name.
const DESKTOP_LOG_NAME: &str = "desktop";
const SERVER_LOG_FILE: &str = "server.log";
const MAX_DESKTOP_LOG_BYTES: u128 = 5 * 1024 * 1024;

struct AppState {
    supervisor: Arc<Supervisor>,
    backups: BackupStore,
}

fn logs_dir_path(app: &AppHandle) -> Result<PathBuf, String> {
    let dir = app
        .path()
        .app_log_dir()
        .map_err(|e| format!("Failed to resolve app log dir: {e}"))?;
    fs::create_dir_all(&dir)
        .map_err(|e| format!("Failed to create app log dir {}: {e}", dir.display()))?;
    Ok(dir)
}

fn data_dir_path(app: &AppHandle) -> Result<PathBuf, String> {
    let dir = app
        .path()
        .app_data_dir()
        .map_err(|e| format!("Failed to resolve app data dir: {e}"))?;
    fs::create_dir_all(&dir)
        .map_err(|e| format!("Failed to create app data directory {}: {e}", dir.display()))?;
    Ok(dir)
}

fn bundled_server_dir(app: &AppHandle) -> PathBuf {
    if cfg!(debug_assertions) {
        return PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("server");
    }
    let resource_dir = app
        .path()
        .resource_dir()
        .unwrap_or_else(|_| PathBuf::from("."));
    let direct = resource_dir.join("server");
    let lifted = resource_dir.join("_up_").join("server");
    if !direct.exists() && lifted.exists() {
        lifted
    } else {
        direct
    }
}

/// `supervisor.json` from the config dir, then env overrides, then paths made
/// absolute under the app dirs and keychain secrets added to the server env.
fn build_config(app: &AppHandle, log_dir: &Path) -> Result<SupervisorConfig, String> {
    let config_dir = app
        .path()
        .app_config_dir()
        .map_err(|e| format!("Failed to resolve app config dir: {e}"))?;
    let data_dir = data_dir_path(app)?;

    let mut config = SupervisorConfig::load(&config_dir.join(CONFIG_FILE)).apply_env();
    if config.source_dir.is_none() {
        config.source_dir = Some(bundled_server_dir(app));
    }
    if config.server_dir.is_relative() {
        config.server_dir = data_dir.join(&config.server_dir);
    }
    if config.env_dir.is_relative() {
        config.env_dir = data_dir.join(&config.env_dir);
    }
    if config.server_log.is_none() {
        config.server_log = Some(log_dir.join(SERVER_LOG_FILE));
    }

    let secrets = collect_server_secrets(&KeyringSecretStore::default());
    for (key, value) in secrets {
        config.extra_env.entry(key).or_insert(value);
    }
    Ok(config.normalized())
}

fn open_in_shell(arg: &str) -> Result<(), String> {
    #[cfg(target_os = "macos")]
    let mut command = {
        let mut cmd = Command::new("open");
        cmd.arg(arg);
        cmd
    };

    #[cfg(target_os = "windows")]
    let mut command = {
        let mut cmd = Command::new("explorer");
        cmd.arg(arg);
        cmd
    };

    #[cfg(all(unix, not(target_os = "macos")))]
    let mut command = {
        let mut cmd = Command::new("xdg-open");
        cmd.arg(arg);
        cmd
    };

    command
        .spawn()
        .map(|_| ())
        .map_err(|e| format!("Failed to open {}: {e}", arg))
}

fn open_path_in_shell(path: &Path) -> Result<(), String> {
    open_in_shell(&path.to_string_lossy())
}

#[tauri::command]
fn open_logs_folder(app: AppHandle) -> Result<String, String> {
    let dir = logs_dir_path(&app)?;
    open_path_in_shell(&dir)?;
    Ok(dir.display().to_string())
}

#[tauri::command]
fn open_server_log_file(app: AppHandle) -> Result<String, String> {
    let log_path = logs_dir_path(&app)?.join(SERVER_LOG_FILE);
    if !log_path.exists() {
        File::create(&log_path)
            .map_err(|e| format!("Failed to create server log {}: {e}", log_path.display()))?;
    }
    open_path_in_shell(&log_path)?;
    Ok(log_path.display().to_string())
}

#[tauri::command]
fn server_status(state: tauri::State<'_, AppState>) -> SupervisorStatus {
    state.supervisor.status()
}

#[tauri::command]
async fn restart_server(state: tauri::State<'_, AppState>) -> Result<ServerEndpoint, String> {
    state
        .supervisor
        .restart()
        .await
        .map_err(|e| format!("Failed to restart server: {e}"))
}

#[tauri::command]
async fn list_backups(state: tauri::State<'_, AppState>) -> Result<Vec<BackupInfo>, String> {
    state
        .backups
        .list_backups()
        .await
        .map_err(|e| format!("Failed to list backups: {e}"))
}

#[tauri::command]
async fn create_backup(state: tauri::State<'_, AppState>) -> Result<BackupInfo, String> {
    state
        .backups
        .create_backup()
        .await
        .map_err(|e| format!("Failed to create backup: {e}"))
}

#[tauri::command]
async fn delete_backup(state: tauri::State<'_, AppState>, name: String) -> Result<(), String> {
    state
        .backups
        .delete_backup(&name)
        .await
        .map_err(|e| format!("Failed to delete backup: {e}"))
}

#[tauri::command]
async fn prune_backups(
    state: tauri::State<'_, AppState>,
    days: Option<u64>,
) -> Result<Vec<BackupInfo>, String> {
    state
        .backups
        .prune_older_than(days.unwrap_or(BACKUP_RETENTION_DAYS))
        .await
        .map_err(|e| format!("Failed to prune backups: {e}"))
}

#[tauri::command]
async fn restore_backup(
    state: tauri::State<'_, AppState>,
    name: String,
) -> Result<Option<BackupInfo>, String> {
    state
        .backups
        .restore(state.supervisor.as_ref(), &name)
        .await
        .map_err(|e| format!("Failed to restore backup: {e}"))
}

fn show_server(app: &AppHandle, endpoint: &ServerEndpoint) {
    let Some(window) = app.get_webview_window(MAIN_WINDOW) else {
        return;
    };
    match endpoint.url.parse::<tauri::Url>() {
        Ok(url) => {
            if let Err(err) = window.navigate(url) {
                error!("failed to load {}: {err}", endpoint.url);
            }
        }
        Err(err) => error!("invalid server url {}: {err}", endpoint.url),
    }
}

fn show_diagnostics(app: &AppHandle, err: &SupervisorError, log_dir: &Path) {
    let Some(window) = app.get_webview_window(MAIN_WINDOW) else {
        return;
    };
    let html = diagnostic_page(err, Some(&log_dir.join(format!("{DESKTOP_LOG_NAME}.log"))));
    let literal = match serde_json::to_string(&html) {
        Ok(literal) => literal,
        Err(err) => {
            error!("failed to encode diagnostic page: {err}");
            return;
        }
    };
    let script = format!("document.open();document.write({literal});document.close();");
    if let Err(err) = window.eval(&script) {
        error!("failed to show diagnostic page: {err}");
    }
}

fn boot_server(app: AppHandle, supervisor: Arc<Supervisor>, log_dir: PathBuf) {
    tauri::async_runtime::spawn(async move {
        let emitter = app.clone();
        let _status_task = supervisor.on_status_change(move |status| {
            let _ = emitter.emit(STATUS_EVENT, status.clone());
        });

        match supervisor.ensure_running().await {
            Ok(endpoint) => {
                info!("server ready at {} (external={})", endpoint.url, endpoint.external);
                show_server(&app, &endpoint);
            }
            Err(err) if err.is_cancelled() => info!("server start aborted: {err}"),
            Err(err) => {
                error!("server failed to start: {err}");
                show_diagnostics(&app, &err, &log_dir);
            }
        }
    });
}

fn stop_server(app: &AppHandle) {
    if let Some(state) = app.try_state::<AppState>() {
        tauri::async_runtime::block_on(state.supervisor.shutdown());
    }
}

/// `desktop.log` in the app log dir. Server output is left out because the
/// launcher already writes it to `server.log`.
fn log_plugin<R: tauri::Runtime>() -> tauri::plugin::TauriPlugin<R> {
    let mut builder = tauri_plugin_log::Builder::new()
        .level(LevelFilter::Info)
        .clear_targets()
        .target(
            Target::new(TargetKind::LogDir {
                file_name: Some(DESKTOP_LOG_NAME.into()),
            })
            .filter(|metadata| !is_server_output(metadata)),
        )
        .max_file_size(MAX_DESKTOP_LOG_BYTES)
        .rotation_strategy(RotationStrategy::KeepOne);
    if cfg!(debug_assertions) {
        builder = builder.target(Target::new(TargetKind::Stdout));
    }
    builder.build()
}

fn main() {
    tauri::Builder::default()
        .plugin(log_plugin())
        .invoke_handler(tauri::generate_handler![
            server_status,
            restart_server,
            list_backups,
            create_backup,
            delete_backup,
            prune_backups,
            restore_backup,
            open_logs_folder,
            open_server_log_file
        ])
        .setup(|app| {
            let handle = app.handle().clone();
            let log_dir = logs_dir_path(&handle)?;
            info!("DDT Manager {} starting", env!("CARGO_PKG_VERSION"));

            let config = build_config(&handle, &log_dir)?;
            let backups = BackupStore::new(
                data_dir_path(&handle)?.join("backups"),
                config.server_dir.join(DATABASE_FILE),
            );
            let supervisor = Arc::new(Supervisor::new(config, SystemRunner).map_err(|e| e.to_string())?);

            let pruning = backups.clone();
            tauri::async_runtime::spawn(async move {
                if let Err(err) = pruning.prune_older_than(BACKUP_RETENTION_DAYS).await {
                    error!("backup retention cleanup failed: {err}");
                }
            });
            app.manage(AppState {
                supervisor: supervisor.clone(),
                backups,
            });
            boot_server(handle, supervisor, log_dir);
            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("error while running DDT Manager")
        .run(|app, event| {
            match &event {
                // macOS: hide window on close instead of quitting (standard behavior)
                #[cfg(target_os = "macos")]
                RunEvent::WindowEvent {
                    label,
                    event: WindowEvent::CloseRequested { api, .. },
                    ..
                } if label == MAIN_WINDOW => {
                    api.prevent_close();
                    if let Some(w) = app.get_webview_window(MAIN_WINDOW) {
                        let _ = w.hide();
                    }
                }
                // macOS: reshow window when dock icon is clicked
                #[cfg(target_os = "macos")]
                RunEvent::Reopen { .. } => {
                    if let Some(w) = app.get_webview_window(MAIN_WINDOW) {
                        let _ = w.show();
                        let _ = w.set_focus();
                    }
                }
                RunEvent::ExitRequested { .. } | RunEvent::Exit => {
                    stop_server(app);
                }
                _ => {}
            }
        });
}
