use std::path::{Path, PathBuf};
use std::sync::Arc;

use finflow_core::config::{AppConfig, WorkerKind};
use finflow_core::traits::LlmClient;
use finflow_tools::builtin::KnowledgeBase;
use finflow_tools::ToolRegistry;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print every check and return whether all passed.
pub fn run_doctor(config: &AppConfig) -> bool {
    let checks = vec![
        check_model(config),
        check_knowledge(config),
        check_database(config),
        check_market_data(config),
        check_workflow(config),
        check_log_dir(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count == 0
}

fn check_model(config: &AppConfig) -> CheckResult {
    let uses_llm = config.workers.is_empty()
        || config.workers.iter().any(|w| w.kind == WorkerKind::Llm);

    let Some(model) = &config.model else {
        return CheckResult {
            label: "Model".into(),
            ok: !uses_llm,
            detail: if uses_llm {
                "No [model] section but LLM workers are configured".into()
            } else {
                "Not needed (static workers only)".into()
            },
        };
    };

    let has_key = model
        .api_key
        .as_ref()
        .is_some_and(|k| !k.is_empty() && !k.starts_with("${"));
    let needs_key = finflow_llm::requires_api_key(&model.provider);
    if !needs_key || has_key {
        CheckResult {
            label: "Model".into(),
            ok: true,
            detail: format!("{} ({})", model.model_id, model.provider),
        }
    } else {
        CheckResult {
            label: "Model".into(),
            ok: false,
            detail: format!("No API key set for provider '{}'", model.provider),
        }
    }
}

fn check_knowledge(config: &AppConfig) -> CheckResult {
    let Some(dir) = &config.tools.knowledge_dir else {
        return CheckResult {
            label: "Knowledge".into(),
            ok: true,
            detail: "Not configured (knowledge_search disabled)".into(),
        };
    };
    match KnowledgeBase::load(Path::new(dir)) {
        Ok(kb) if kb.is_empty() => CheckResult {
            label: "Knowledge".into(),
            ok: false,
            detail: format!("{} has no .txt collections", dir),
        },
        Ok(kb) => CheckResult {
            label: "Knowledge".into(),
            ok: true,
            detail: format!("{} ({} passages)", dir, kb.len()),
        },
        Err(e) => CheckResult {
            label: "Knowledge".into(),
            ok: false,
            detail: format!("{}: {}", dir, e),
        },
    }
}

fn check_database(config: &AppConfig) -> CheckResult {
    let Some(path) = &config.tools.database else {
        return CheckResult {
            label: "Database".into(),
            ok: true,
            detail: "Not configured (portfolio_query disabled)".into(),
        };
    };
    let flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY;
    let opened = rusqlite::Connection::open_with_flags(path, flags).and_then(|conn| {
        conn.query_row("SELECT COUNT(*) FROM portfolios", [], |row| row.get::<_, i64>(0))
    });
    match opened {
        Ok(count) => CheckResult {
            label: "Database".into(),
            ok: true,
            detail: format!("{} ({} portfolios)", path, count),
        },
        Err(e) => CheckResult {
            label: "Database".into(),
            ok: false,
            detail: format!("{}: {}", path, e),
        },
    }
}

fn check_market_data(config: &AppConfig) -> CheckResult {
    match &config.tools.market_data {
        None => CheckResult {
            label: "Market data".into(),
            ok: true,
            detail: "Not configured".into(),
        },
        Some(m) if !m.url_template.contains("{ticker}") => CheckResult {
            label: "Market data".into(),
            ok: false,
            detail: format!("url_template has no {{ticker}} placeholder: {}", m.url_template),
        },
        Some(m) => CheckResult {
            label: "Market data".into(),
            ok: true,
            detail: m.url_template.clone(),
        },
    }
}

fn check_workflow(config: &AppConfig) -> CheckResult {
    // A dry assembly validates the graph without touching any data source
    let llm: Option<Arc<dyn LlmClient>> = config.model.as_ref().map(finflow_llm::create_client);
    match finflow_agent::assemble(config, Arc::new(ToolRegistry::new()), llm) {
        Ok(flow) => CheckResult {
            label: "Workflow".into(),
            ok: true,
            detail: format!(
                "{} nodes, {} entries",
                flow.graph().len(),
                flow.graph().entries().len()
            ),
        },
        Err(e) => CheckResult {
            label: "Workflow".into(),
            ok: false,
            detail: e.to_string(),
        },
    }
}

fn check_log_dir(config: &AppConfig) -> CheckResult {
    let Some(log) = config.engine.log.as_ref().filter(|l| l.enabled) else {
        return CheckResult {
            label: "Run log".into(),
            ok: true,
            detail: "Disabled".into(),
        };
    };
    let dir = PathBuf::from(log.log_dir.clone().unwrap_or_else(|| "logs".into()));
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return CheckResult {
            label: "Run log".into(),
            ok: false,
            detail: format!("{} (cannot create: {})", dir.display(), e),
        };
    }
    let test_file = dir.join(".doctor_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            std::fs::remove_file(&test_file).ok();
            CheckResult {
                label: "Run log".into(),
                ok: true,
                detail: format!("{} (level {})", dir.display(), log.level),
            }
        }
        Err(e) => CheckResult {
            label: "Run log".into(),
            ok: false,
            detail: format!("{} (not writable: {})", dir.display(), e),
        },
    }
}
