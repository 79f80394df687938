use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::{EvidenceMetadata, EvidenceRecord, EvidenceRecorder, EvidenceType};
use crate::error::{Error, Result};
use crate::redact::sanitize_log_line;
use crate::remote::{Session, sh_quote};
use crate::store::ServerRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogCollectionResult {
    pub path: String,
    pub success: bool,
    pub evidence_id: Option<String>,
    pub truncated: bool,
    pub size_bytes: Option<u64>,
    /// Lines actually collected, which is less than the file's when truncated.
    pub line_count: Option<usize>,
    pub signature: Option<String>,
    pub error: Option<String>,
}

impl LogCollectionResult {
    fn failed(path: &str, error: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            success: false,
            evidence_id: None,
            truncated: false,
            size_bytes: None,
            line_count: None,
            signature: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutputCapture {
    pub evidence_id: String,
    /// Redacted form of the command that was run.
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
    pub timed_out: bool,
}

const SYSTEM_PROBES: &[(&str, &str)] = &[
    ("kernel", "uname -a"),
    ("uptime", "uptime"),
    ("disk", "df -h"),
    ("memory", "free -m"),
    ("php_version", "php -v 2>&1 | head -n 1"),
    (
        "web_server",
        "for s in nginx apache2 httpd php-fpm; do printf '%s: ' \"$s\"; systemctl is-active \"$s\" 2>/dev/null || echo unknown; done",
    ),
];

impl EvidenceRecorder {
    fn server_for(&self, incident_id: &str, server_id: &str) -> Result<ServerRecord> {
        self.store
            .find_incident(incident_id)?
            .ok_or_else(|| Error::not_found("incident", incident_id))?;
        self.store
            .find_server(server_id)?
            .ok_or_else(|| Error::not_found("server", server_id))
    }

    fn session<'a>(&'a self, server: &ServerRecord) -> Result<Session<'a>> {
        Session::open(self.channel.as_ref(), server, self.settings.command_timeout)
    }

    /// Collects each log independently; one unreadable path does not affect
    /// the others.
    pub fn collect_log_files(
        &self,
        incident_id: &str,
        server_id: &str,
        paths: &[String],
    ) -> Result<Vec<LogCollectionResult>> {
        let server = self.server_for(incident_id, server_id)?;
        let session = self.session(&server)?;
        Ok(paths
            .iter()
            .map(|path| {
                self.collect_one_log(&session, incident_id, server_id, path)
                    .unwrap_or_else(|e| {
                        warn!(incident_id = %incident_id, path = %path, error = %e, "log collection failed");
                        LogCollectionResult::failed(path, e.to_string())
                    })
            })
            .collect())
    }

    fn collect_one_log(
        &self,
        session: &Session<'_>,
        incident_id: &str,
        server_id: &str,
        path: &str,
    ) -> Result<LogCollectionResult> {
        let Some(stat) = session.stat(path)? else {
            return Ok(LogCollectionResult::failed(path, "file not found"));
        };
        if stat.is_dir {
            return Ok(LogCollectionResult::failed(path, "path is a directory"));
        }
        let truncated = stat.size > self.settings.full_read_max_bytes;
        let content = if truncated {
            session.exec_ok(&format!(
                "tail -n {} {}",
                self.settings.max_log_lines,
                sh_quote(path)
            ))?
        } else {
            session.read_file(path)?
        };
        let meta = EvidenceMetadata::default()
            .with_extra("source_path", path)
            .with_extra("server_id", server_id)
            .with_extra("file_size", stat.size)
            .with_extra("truncated", truncated);
        let line_count = content.lines().count();
        let record = self.store_evidence(incident_id, EvidenceType::for_log_path(path), &content, meta)?;
        Ok(LogCollectionResult {
            path: path.to_string(),
            success: true,
            evidence_id: Some(record.id),
            truncated,
            size_bytes: Some(stat.size),
            line_count: Some(line_count),
            signature: Some(record.signature),
            error: None,
        })
    }

    pub fn capture_command_output(
        &self,
        incident_id: &str,
        server_id: &str,
        command: &str,
    ) -> Result<CommandOutputCapture> {
        let redacted = self.redactor.redact_command(command);
        let server = self.server_for(incident_id, server_id)?;
        let session = self.session(&server)?;
        let started = Instant::now();
        let out = session.exec(command)?;
        let execution_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            incident_id = %incident_id,
            command = %sanitize_log_line(&redacted),
            exit_code = out.exit_code,
            "captured command output"
        );

        let stdout = self.redactor.redact_text(&out.stdout);
        let stderr = self.redactor.redact_text(&out.stderr);
        let body = json!({
            "command": redacted,
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": out.exit_code,
            "execution_time_ms": execution_time_ms,
        });
        let content = serde_json::to_string_pretty(&body)?;
        let meta = EvidenceMetadata::default()
            .with_extra("server_id", server_id)
            .with_extra("command", redacted.clone())
            .with_extra("timed_out", out.timed_out);
        let record = self.store_evidence(incident_id, EvidenceType::CommandOutput, &content, meta)?;
        Ok(CommandOutputCapture {
            evidence_id: record.id,
            command: redacted,
            stdout,
            stderr,
            exit_code: out.exit_code,
            execution_time_ms,
            timed_out: out.timed_out,
        })
    }

    /// One `SYSTEM_INFO` record covering kernel, load, disk, memory, PHP and
    /// web server state. Individual probe failures are recorded, not raised.
    pub fn collect_system_diagnostics(&self, incident_id: &str, server_id: &str) -> Result<EvidenceRecord> {
        let server = self.server_for(incident_id, server_id)?;
        let session = self.session(&server)?;
        let report = run_probes(&session, SYSTEM_PROBES.iter().map(|(k, c)| (*k, c.to_string())));
        let content = serde_json::to_string_pretty(&report)?;
        let meta = EvidenceMetadata::default()
            .with_extra("server_id", server_id)
            .with_extra("collector", "system");
        self.store_evidence(incident_id, EvidenceType::SystemInfo, &content, meta)
    }

    pub fn collect_wordpress_diagnostics(
        &self,
        incident_id: &str,
        server_id: &str,
        wordpress_path: &str,
    ) -> Result<EvidenceRecord> {
        let server = self.server_for(incident_id, server_id)?;
        let session = self.session(&server)?;
        let wp = format!("--path={} --allow-root", sh_quote(wordpress_path));
        let probes = [
            ("core_version", format!("wp core version {wp}")),
            (
                "active_plugins",
                format!("wp plugin list --status=active --format=json {wp}"),
            ),
            (
                "active_theme",
                format!("wp theme list --status=active --field=name {wp}"),
            ),
            ("core_checksums", format!("wp core verify-checksums {wp} 2>&1")),
        ];
        let report = run_probes(&session, probes.into_iter());
        let content = serde_json::to_string_pretty(&report)?;
        let meta = EvidenceMetadata::default()
            .with_extra("server_id", server_id)
            .with_extra("wordpress_path", wordpress_path)
            .with_extra("collector", "wordpress");
        self.store_evidence(incident_id, EvidenceType::WordpressInfo, &content, meta)
    }
}

fn run_probes<'k>(session: &Session<'_>, probes: impl Iterator<Item = (&'k str, String)>) -> Value {
    let mut report = Map::new();
    for (key, command) in probes {
        let entry = match session.exec(&command) {
            Ok(out) => json!({
                "exit_code": out.exit_code,
                "output": out.stdout.trim(),
                "error": (!out.success()).then(|| out.summary()),
            }),
            Err(e) => json!({ "exit_code": null, "output": "", "error": e.to_string() }),
        };
        report.insert(key.to_string(), entry);
    }
    Value::Object(report)
}
