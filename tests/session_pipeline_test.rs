//! 会话流水线集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use foampilot::agent::AgentEvent;
    use foampilot::config::AppConfig;
    use foampilot::core::{
        Orchestrator, PermissionLevel, PhaseStatus, SessionStatus, StateManager,
    };
    use foampilot::llm::MockLlmClient;
    use foampilot::tools::{Tool, ToolRegistry};
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;

    struct StubTool {
        name: &'static str,
        output: &'static str,
    }

    #[async_trait]
    impl Tool for StubTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn permission_level(&self) -> PermissionLevel {
            PermissionLevel::Auto
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(self.output.to_string())
        }
    }

    fn domain_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register(StubTool {
            name: "search_tutorials",
            output: "incompressible/simpleFoam/pitzDaily",
        });
        reg.register(StubTool {
            name: "copy_tutorial",
            output: "copied tutorial into case",
        });
        reg.register(StubTool {
            name: "read_file",
            output: "FoamFile { version 2.0; }",
        });
        reg.register(StubTool {
            name: "write_file",
            output: "written",
        });
        reg.register(StubTool {
            name: "list_files",
            output: "0/ constant/ system/",
        });
        reg.register(StubTool {
            name: "run_command",
            output: "Mesh OK",
        });
        reg
    }

    fn test_config(dir: &tempfile::TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.cases_dir = Some(dir.path().to_path_buf());
        cfg
    }

    const CONSULT_OK: &str = r#"{"solver": "simpleFoam", "physics": {"type": "incompressible_steady_turbulent", "is_transient": false, "is_turbulent": true, "turbulence_model": "kOmegaSST"}, "assumptions": ["steady RANS"], "tutorial_keywords": ["pitzDaily"]}"#;
    const SETUP_TOOL: &str =
        r#"{"tool": "copy_tutorial", "args": {"tutorial": "incompressible/simpleFoam/pitzDaily"}}"#;
    const SETUP_OK: &str = r#"{"tutorial_source": "incompressible/simpleFoam/pitzDaily", "case_dir": "case", "files_modified": [{"path": "0/U", "action": "edited", "description": "inlet velocity 10 m/s"}], "assumptions": ["kOmegaSST wall functions"]}"#;
    const MESH_TOOL: &str = r#"{"tool": "run_command", "args": {"command": "blockMesh"}}"#;
    const MESH_OK: &str = r#"{"passed": true, "cells": 40000, "max_non_orthogonality": 32.5, "max_skewness": 1.1, "issues": []}"#;
    const MESH_BAD: &str =
        r#"{"passed": false, "issues": ["max skewness 6.2 above limit 4"]}"#;
    const RUN_OK: &str = r#"{"converged": true, "iterations": 312, "final_residuals": {"Ux": 8.1e-5, "p": 9.0e-5}, "issues": []}"#;
    const RUN_DIVERGED: &str = r#"{"converged": false, "iterations": 1000, "final_residuals": {"p": 0.4}, "issues": ["pressure residual stalled at 4e-1"]}"#;
    const ANALYZE_OK: &str = r#"{"summary": "Flow reattaches at x/h = 6.1; pressure drop 12 Pa.", "quantities": {"pressure_drop_pa": 12.0}, "warnings": []}"#;

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn test_full_pipeline_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new(vec![
            CONSULT_OK.to_string(),
            SETUP_TOOL.to_string(),
            SETUP_OK.to_string(),
            MESH_TOOL.to_string(),
            MESH_OK.to_string(),
            RUN_OK.to_string(),
            ANALYZE_OK.to_string(),
        ]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator =
            Orchestrator::new(test_config(&dir), mock.clone(), domain_registry())
                .unwrap()
                .with_event_tx(tx);

        let state = orchestrator
            .run("Simulate 2D backward-facing step at 10 m/s")
            .await
            .unwrap();

        assert_eq!(state.status, SessionStatus::Completed);
        assert_eq!(state.phases.len(), 5);
        assert!(state
            .phases
            .iter()
            .all(|p| p.status == PhaseStatus::Succeeded));
        assert_eq!(mock.remaining(), 0, "entire script must be consumed");

        // 每个阶段边界都落了盘：终态文件可重新加载
        let session_dir = dir.path().join(format!("case_{}", state.session_id));
        let loaded = StateManager::new(&session_dir).load().unwrap();
        assert_eq!(loaded.status, SessionStatus::Completed);
        assert_eq!(loaded.phases.len(), 5);
        assert!(session_dir.join("FOAMPILOT.md").exists());
        let log = std::fs::read_to_string(session_dir.join("session.log")).unwrap();
        assert!(log.contains("phase consult started"));
        assert!(log.contains("phase analyze completed"));

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::SessionEnd { status, .. } if status == "completed")));
    }

    #[tokio::test]
    async fn test_downstream_prompts_carry_validated_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new(vec![
            CONSULT_OK.to_string(),
            SETUP_OK.to_string(),
            MESH_OK.to_string(),
            RUN_OK.to_string(),
            ANALYZE_OK.to_string(),
        ]));
        let orchestrator =
            Orchestrator::new(test_config(&dir), mock.clone(), domain_registry()).unwrap();

        let state = orchestrator.run("pitzDaily rerun").await.unwrap();
        assert_eq!(state.status, SessionStatus::Completed);

        let requests = mock.recorded_requests();
        assert_eq!(requests.len(), 5);
        // Run 阶段的任务提示词携带 Mesh 载荷（而非对话原文）
        let run_request = &requests[3];
        assert!(run_request
            .iter()
            .any(|m| m.content.contains("\"cells\":40000")));
        // Analyze 阶段看得到 Run 的残差
        let analyze_request = &requests[4];
        assert!(analyze_request
            .iter()
            .any(|m| m.content.contains("\"converged\":true")));
    }

    #[tokio::test]
    async fn test_mesh_failure_reroutes_to_setup_with_feedback() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new(vec![
            CONSULT_OK.to_string(),
            SETUP_OK.to_string(),
            MESH_BAD.to_string(),
            SETUP_OK.to_string(),
            MESH_OK.to_string(),
            RUN_OK.to_string(),
            ANALYZE_OK.to_string(),
        ]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator =
            Orchestrator::new(test_config(&dir), mock.clone(), domain_registry())
                .unwrap()
                .with_event_tx(tx);

        let state = orchestrator.run("pitzDaily").await.unwrap();
        assert_eq!(state.status, SessionStatus::Completed);

        // 第二次 Setup 的任务提示词带着网格失败详情
        let requests = mock.recorded_requests();
        assert!(requests.iter().any(|req| req.iter().any(|m| {
            m.content.contains("Previous mesh attempt failed")
                && m.content.contains("max skewness 6.2 above limit 4")
        })));

        let events = drain(&mut rx);
        let reroutes = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Rerouted { .. }))
            .count();
        assert_eq!(reroutes, 1);

        // 失败的 Mesh 记录保留在案，成功的排在其后
        let mesh_records: Vec<_> = state
            .phases
            .iter()
            .filter(|p| p.kind == foampilot::contract::PhaseKind::Mesh)
            .collect();
        assert_eq!(mesh_records.len(), 2);
        assert_eq!(mesh_records[0].status, PhaseStatus::Failed);
        assert_eq!(mesh_records[1].status, PhaseStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_mesh_failure_budget_exhausts_session() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new(vec![
            CONSULT_OK.to_string(),
            SETUP_OK.to_string(),
            MESH_BAD.to_string(),
            SETUP_OK.to_string(),
            MESH_BAD.to_string(),
            SETUP_OK.to_string(),
            MESH_BAD.to_string(),
        ]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator =
            Orchestrator::new(test_config(&dir), mock.clone(), domain_registry())
                .unwrap()
                .with_event_tx(tx);

        let state = orchestrator.run("pitzDaily").await.unwrap();
        assert_eq!(state.status, SessionStatus::Failed);
        assert_eq!(mock.remaining(), 0);

        let events = drain(&mut rx);
        let reroutes = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Rerouted { .. }))
            .count();
        assert_eq!(reroutes, 2, "two reroutes then the session fails");

        // Run / Analyze 从未被调度
        assert!(!state
            .phases
            .iter()
            .any(|p| p.kind == foampilot::contract::PhaseKind::Run));
    }

    #[tokio::test]
    async fn test_run_divergence_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new(vec![
            CONSULT_OK.to_string(),
            SETUP_OK.to_string(),
            MESH_OK.to_string(),
            RUN_DIVERGED.to_string(),
        ]));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let orchestrator =
            Orchestrator::new(test_config(&dir), mock.clone(), domain_registry())
                .unwrap()
                .with_event_tx(tx);

        let state = orchestrator.run("pitzDaily").await.unwrap();
        assert_eq!(state.status, SessionStatus::Failed);
        assert_eq!(mock.remaining(), 0, "no second run attempt");

        let run_records: Vec<_> = state
            .phases
            .iter()
            .filter(|p| p.kind == foampilot::contract::PhaseKind::Run)
            .collect();
        assert_eq!(run_records.len(), 1);
        assert_eq!(run_records[0].status, PhaseStatus::Failed);

        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Rerouted { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockLlmClient::new(vec![CONSULT_OK.to_string()]));
        let token = CancellationToken::new();
        token.cancel();
        let orchestrator = Orchestrator::new(test_config(&dir), mock, domain_registry())
            .unwrap()
            .with_cancel_token(token);

        let state = orchestrator.run("pitzDaily").await.unwrap();
        assert_eq!(state.status, SessionStatus::Aborted);
        assert_eq!(state.phases.len(), 1);
        assert_eq!(state.phases[0].status, PhaseStatus::Aborted);
    }
}
