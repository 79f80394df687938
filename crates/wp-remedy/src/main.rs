use clap::{Parser, Subcommand};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use wp_remedy::audit::TracingAuditLog;
use wp_remedy::backup::{ArtifactType, BackupManager, BackupMetadata, BackupSettings};
use wp_remedy::config::{self, EngineConfig};
use wp_remedy::evidence::{EvidenceFilter, EvidenceRecorder, EvidenceSettings, EvidenceType};
use wp_remedy::playbooks::{FixContext, PlaybookDeps, PlaybookRegistry};
use wp_remedy::probe::HttpSiteProbe;
use wp_remedy::redact::PatternRedactor;
use wp_remedy::remote::SshChannel;
use wp_remedy::store::{ArtifactStore, IncidentRecord, JsonFileStore, ServerRecord};
use wp_remedy::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Engine config TOML (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register or update a server record
    Server {
        id: String,
        hostname: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Open an incident against a site on a registered server
    Incident {
        id: String,
        #[arg(long)]
        site: String,
        #[arg(long)]
        server: String,
        #[arg(long)]
        domain: Option<String>,
    },
    /// Back up one remote file
    BackupFile {
        #[arg(long)]
        incident: String,
        #[arg(long)]
        path: String,
        #[arg(long = "type", default_value = "file-backup")]
        artifact_type: ArtifactType,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Back up a remote directory as a tar.gz
    BackupDir {
        #[arg(long)]
        incident: String,
        #[arg(long)]
        path: String,
        #[arg(long = "type", default_value = "directory-backup")]
        artifact_type: ArtifactType,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Re-check a backup's local file against its recorded checksum and size
    Validate { artifact: String },
    /// List an incident's backups, newest first
    Backups { incident: String },
    /// Restore an incident's backups, newest first
    Rollback {
        incident: String,
        /// Restrict to these artifact ids (repeatable)
        #[arg(long = "artifact")]
        artifacts: Vec<String>,
    },
    #[command(subcommand)]
    Evidence(EvidenceCommand),
    #[command(subcommand)]
    Playbooks(PlaybookCommand),
}

#[derive(Debug, Subcommand)]
enum EvidenceCommand {
    Search {
        #[arg(long)]
        incident: Option<String>,
        #[arg(long = "type")]
        evidence_type: Option<EvidenceType>,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        text: Option<String>,
        #[arg(long, default_value_t = wp_remedy::evidence::DEFAULT_SEARCH_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Show { id: String },
    Verify { id: String },
    /// Collect log files from the incident's server
    CollectLogs {
        #[arg(long)]
        incident: String,
        paths: Vec<String>,
    },
    /// Capture system (and optionally WordPress) diagnostics
    Diagnostics {
        #[arg(long)]
        incident: String,
        #[arg(long)]
        wp_path: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum PlaybookCommand {
    List,
    Run {
        id: String,
        #[arg(long)]
        incident: String,
        /// WordPress root on the server
        #[arg(long)]
        wp_path: String,
        /// Overrides the incident's domain
        #[arg(long)]
        domain: Option<String>,
        /// Undo the changes when the fix applies but does not succeed
        #[arg(long)]
        auto_rollback: bool,
    },
}

struct Engine {
    store: Arc<dyn ArtifactStore>,
    backups: Arc<BackupManager>,
    evidence: Arc<EvidenceRecorder>,
    registry: PlaybookRegistry,
}

impl Engine {
    fn open(cfg: &EngineConfig, base: &Path) -> Result<Self> {
        let root = cfg.store_root(base);
        let store: Arc<dyn ArtifactStore> = Arc::new(JsonFileStore::open(&root)?);
        let channel = Arc::new(SshChannel::new(
            cfg.servers.clone(),
            root.join("ssh"),
            Duration::from_secs(cfg.remote.transfer_timeout_secs),
        ));
        let audit = Arc::new(TracingAuditLog);
        let backups = Arc::new(BackupManager::new(
            store.clone(),
            channel.clone(),
            audit.clone(),
            BackupSettings::from_config(cfg, base),
        ));
        let evidence = Arc::new(EvidenceRecorder::new(
            store.clone(),
            channel.clone(),
            audit,
            Arc::new(PatternRedactor::new()),
            EvidenceSettings::from_config(cfg),
        ));
        let deps = Arc::new(PlaybookDeps {
            store: store.clone(),
            channel,
            backups: backups.clone(),
            evidence: evidence.clone(),
            probe: Arc::new(HttpSiteProbe::from_config(&cfg.probe)?),
            command_timeout: Duration::from_secs(cfg.remote.command_timeout_secs),
            probe_scheme: cfg.probe.scheme.clone(),
        });
        Ok(Self {
            store,
            backups,
            evidence,
            registry: PlaybookRegistry::builtin(deps),
        })
    }

    fn incident(&self, id: &str) -> Result<IncidentRecord> {
        self.store
            .find_incident(id)?
            .ok_or_else(|| Error::not_found("incident", id))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        fmt.json().init();
    } else {
        fmt.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<(EngineConfig, PathBuf)> {
    match path {
        Some(p) => {
            let doc = config::load(p)?;
            Ok((EngineConfig::from_doc(&doc)?, p.to_path_buf()))
        }
        None => Ok((EngineConfig::default(), PathBuf::from("."))),
    }
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.json);

    let (cfg, base) = load_config(args.config.as_deref())?;
    let engine = Engine::open(&cfg, &base)?;

    match args.cmd {
        Command::Server {
            id,
            hostname,
            user,
            port,
        } => {
            let mut server = ServerRecord::new(id, hostname);
            server.ssh_user = user;
            server.ssh_port = port;
            engine.store.save_server(&server)?;
            print_json(&server)
        }
        Command::Incident {
            id,
            site,
            server,
            domain,
        } => {
            if engine.store.find_server(&server)?.is_none() {
                return Err(Error::not_found("server", server));
            }
            let mut incident = IncidentRecord::new(id, site, server);
            incident.domain = domain;
            engine.store.save_incident(&incident)?;
            print_json(&incident)
        }
        Command::BackupFile {
            incident,
            path,
            artifact_type,
            reason,
        } => {
            let inc = engine.incident(&incident)?;
            let meta = reason.map(BackupMetadata::reason).unwrap_or_default();
            let res = engine.backups.create_file_backup(
                &inc.id,
                &inc.server_id,
                &path,
                artifact_type,
                meta,
            )?;
            print_json(&res)
        }
        Command::BackupDir {
            incident,
            path,
            artifact_type,
            reason,
        } => {
            let inc = engine.incident(&incident)?;
            let meta = reason.map(BackupMetadata::reason).unwrap_or_default();
            let res = engine.backups.create_directory_backup(
                &inc.id,
                &inc.server_id,
                &path,
                artifact_type,
                meta,
            )?;
            print_json(&res)
        }
        Command::Validate { artifact } => {
            print_json(&engine.backups.validate_backup_artifact(&artifact)?)
        }
        Command::Backups { incident } => print_json(&engine.backups.list_backups(&incident)?),
        Command::Rollback {
            incident,
            artifacts,
        } => {
            let ids = (!artifacts.is_empty()).then_some(artifacts.as_slice());
            print_json(&engine.backups.execute_rollback(&incident, ids)?)
        }
        Command::Evidence(cmd) => run_evidence(&engine, cmd),
        Command::Playbooks(cmd) => run_playbooks(&engine, cmd),
    }
}

fn run_evidence(engine: &Engine, cmd: EvidenceCommand) -> Result<()> {
    match cmd {
        EvidenceCommand::Search {
            incident,
            evidence_type,
            from,
            to,
            text,
            limit,
            offset,
        } => {
            let filter = EvidenceFilter {
                incident_id: incident,
                evidence_type,
                from,
                to,
                text,
                signature: None,
                limit,
                offset,
            };
            print_json(&engine.evidence.search_evidence(&filter)?)
        }
        EvidenceCommand::Show { id } => print_json(&engine.evidence.get_evidence_by_id(&id)?),
        EvidenceCommand::Verify { id } => {
            let ok = engine.evidence.verify_evidence_signature(&id)?;
            println!("{id}: {}", if ok { "signature ok" } else { "SIGNATURE MISMATCH" });
            if ok {
                Ok(())
            } else {
                Err(Error::Validation {
                    artifact_id: id,
                    message: "evidence signature mismatch".into(),
                })
            }
        }
        EvidenceCommand::CollectLogs { incident, paths } => {
            let inc = engine.incident(&incident)?;
            print_json(
                &engine
                    .evidence
                    .collect_log_files(&inc.id, &inc.server_id, &paths)?,
            )
        }
        EvidenceCommand::Diagnostics { incident, wp_path } => {
            let inc = engine.incident(&incident)?;
            let system = engine
                .evidence
                .collect_system_diagnostics(&inc.id, &inc.server_id)?;
            print_json(&system)?;
            if let Some(wp) = wp_path {
                let wp = engine
                    .evidence
                    .collect_wordpress_diagnostics(&inc.id, &inc.server_id, &wp)?;
                print_json(&wp)?;
            }
            Ok(())
        }
    }
}

fn run_playbooks(engine: &Engine, cmd: PlaybookCommand) -> Result<()> {
    match cmd {
        PlaybookCommand::List => {
            for info in engine.registry.infos() {
                println!(
                    "{:<22} {:<30} {:<9} {}",
                    info.id,
                    info.tier.as_str(),
                    info.priority.as_str(),
                    info.name
                );
            }
            Ok(())
        }
        PlaybookCommand::Run {
            id,
            incident,
            wp_path,
            domain,
            auto_rollback,
        } => {
            let inc = engine.incident(&incident)?;
            let domain = domain
                .or_else(|| inc.domain.clone())
                .ok_or_else(|| Error::Config(format!("incident {} has no domain; pass --domain", inc.id)))?;
            let ctx = FixContext::new(&inc.id, &inc.site_id, &inc.server_id, wp_path, domain);
            print_json(&engine.registry.run(&id, &ctx, auto_rollback)?)
        }
    }
}
