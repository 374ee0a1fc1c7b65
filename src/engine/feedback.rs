//! Feedback capture: screenshot the scene, persist it, get vision feedback.

use std::path::{Path, PathBuf};

use base64::Engine as _;

use super::classify::extract_score;
use super::task::{Goal, ToolInvocationRecord};
use super::EngineError;
use crate::llm::gateway::VisionGateway;
use crate::rpc::{ToolClient, ToolSchema};

/// Screenshot tool names tried in order before falling back to any tool
/// whose name contains "screenshot".
const SCREENSHOT_TOOL_PREFERENCE: &[&str] = &["get_viewport_screenshot", "capture_viewport"];

/// Tools tried (best-effort) to frame the scene before capturing.
const FRAMING_TOOL_HINTS: &[&str] = &["frame", "view_all", "fit_view"];

/// Code-execution tool preferred for framing when the endpoint has one.
const CODE_TOOL: &str = "execute_blender_code";

/// Rotates the viewport to a front-right-top angle and frames every
/// visible object, so occluded work shows up in the screenshot.
const FRAME_VIEWPORT_CODE: &str = r#"
import bpy
try:
    for area in bpy.context.screen.areas:
        if area.type == 'VIEW_3D':
            for space in area.spaces:
                if space.type == 'VIEW_3D':
                    space.region_3d.view_rotation = (0.8205, 0.4247, 0.1920, 0.3272)
                    override = bpy.context.copy()
                    override['area'] = area
                    override['region'] = area.regions[-1]
                    with bpy.context.temp_override(**override):
                        bpy.ops.view3d.view_all(center=False)
                    break
            break
except Exception as e:
    print(f"Camera adjustment failed: {e}")
"#;

/// One feedback cycle's output.
#[derive(Debug)]
pub struct FeedbackResult {
    pub artifact: PathBuf,
    pub feedback: String,
    pub score: u8,
    /// Record of the screenshot tool call, for the task's append-only log
    pub record: ToolInvocationRecord,
}

pub struct FeedbackCapturer {
    vision: VisionGateway,
    screenshots_root: PathBuf,
}

impl FeedbackCapturer {
    pub fn new(vision: VisionGateway, screenshots_root: PathBuf) -> Self {
        Self {
            vision,
            screenshots_root,
        }
    }

    /// Capture a screenshot for the step, persist it under the session's
    /// artifact directory, and score it against the goal.
    ///
    /// For image goals the persisted screenshot is compared against the
    /// reference image; for briefs the vision model judges the screenshot
    /// against the brief text alone.
    #[allow(clippy::too_many_arguments)]
    pub async fn capture(
        &self,
        tool_client: &dyn ToolClient,
        tools: &[ToolSchema],
        session_key: &str,
        goal: &Goal,
        reference_image: Option<&str>,
        step_index: usize,
        step_text: &str,
        refinement: u32,
    ) -> Result<FeedbackResult, EngineError> {
        self.frame_scene(tool_client, tools).await;

        let tool_name = screenshot_tool(tools)
            .ok_or_else(|| EngineError::MissingTool("screenshot".to_string()))?;

        let outcome = tool_client
            .call_tool(tool_name, serde_json::json!({}))
            .await?;
        if !outcome.success {
            return Err(EngineError::Capture(outcome.result));
        }
        let image_base64 = outcome
            .image_data
            .ok_or_else(|| EngineError::Capture("screenshot returned no image data".to_string()))?;

        let artifact = self
            .persist(session_key, step_index, refinement, &image_base64)
            .await?;
        tracing::info!(path = %artifact.display(), "screenshot persisted");

        let feedback = match (goal, reference_image) {
            (Goal::Image { .. }, Some(reference)) => {
                let prompt = format!(
                    "The first image is the reference to reproduce; the second is the \
                     current state of the 3D scene after the step \"{}\". Compare them: \
                     note matching and missing elements, proportions, and arrangement. \
                     End with an overall similarity score as NN/100.",
                    step_text
                );
                self.vision.compare(&prompt, reference, &image_base64).await?
            }
            _ => {
                let prompt = format!(
                    "This is the current state of a 3D scene being built toward the goal: \
                     \"{}\". The step just executed was \"{}\". Assess whether the step's \
                     work is present and well-formed, and whether it is clearly visible. \
                     End with a quality score as NN/100.",
                    goal.describe(),
                    step_text
                );
                self.vision.analyze(&prompt, &image_base64).await?
            }
        };

        let score = extract_score(&feedback);
        let record = ToolInvocationRecord {
            step_index,
            tool: tool_name.to_string(),
            params: serde_json::json!({}),
            success: true,
            result: "screenshot captured".to_string(),
            artifact: Some(artifact.clone()),
        };

        Ok(FeedbackResult {
            artifact,
            feedback,
            score,
            record,
        })
    }

    /// Try to frame the scene so the screenshot shows the work. Purely
    /// best-effort: a missing tool or failed call changes nothing.
    ///
    /// A code-execution tool gets the full viewport-framing snippet;
    /// otherwise any tool whose name suggests framing is called bare.
    async fn frame_scene(&self, tool_client: &dyn ToolClient, tools: &[ToolSchema]) {
        if tools.iter().any(|t| t.name == CODE_TOOL) {
            let params = serde_json::json!({ "code": FRAME_VIEWPORT_CODE });
            if let Err(e) = tool_client.call_tool(CODE_TOOL, params).await {
                tracing::debug!(tool = CODE_TOOL, "framing call failed: {}", e);
            }
            return;
        }
        let candidate = tools.iter().find(|t| {
            let name = t.name.to_lowercase();
            FRAMING_TOOL_HINTS.iter().any(|h| name.contains(h))
        });
        if let Some(tool) = candidate {
            if let Err(e) = tool_client.call_tool(&tool.name, serde_json::json!({})).await {
                tracing::debug!(tool = %tool.name, "framing call failed: {}", e);
            }
        }
    }

    /// Write the image under `screenshots/<session_key>/`. Existing files
    /// are never overwritten; a numeric suffix disambiguates collisions.
    async fn persist(
        &self,
        session_key: &str,
        step_index: usize,
        refinement: u32,
        image_base64: &str,
    ) -> Result<PathBuf, EngineError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(image_base64)
            .map_err(|e| EngineError::Capture(format!("invalid image data: {}", e)))?;

        let dir = self.screenshots_root.join(session_key);
        tokio::fs::create_dir_all(&dir).await?;

        let path = unique_artifact_path(&dir, step_index, refinement);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

fn artifact_name(step_index: usize, refinement: u32, collision: u32) -> String {
    let mut name = format!("step_{:03}", step_index);
    if refinement > 0 {
        name.push_str(&format!("_refine{}", refinement));
    }
    if collision > 0 {
        name.push_str(&format!("_{}", collision));
    }
    name.push_str(".png");
    name
}

fn unique_artifact_path(dir: &Path, step_index: usize, refinement: u32) -> PathBuf {
    let mut collision = 0;
    loop {
        let path = dir.join(artifact_name(step_index, refinement, collision));
        if !path.exists() {
            return path;
        }
        collision += 1;
    }
}

/// Pick the screenshot tool: preferred names first, then any tool whose
/// name mentions "screenshot".
pub fn screenshot_tool(tools: &[ToolSchema]) -> Option<&str> {
    for preferred in SCREENSHOT_TOOL_PREFERENCE {
        if let Some(tool) = tools.iter().find(|t| t.name == *preferred) {
            return Some(&tool.name);
        }
    }
    tools
        .iter()
        .find(|t| t.name.to_lowercase().contains("screenshot"))
        .map(|t| t.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::llm::{
        ChatMessage, ChatOptions, ChatResponse, LlmClient, LlmError, ToolDefinition,
    };
    use crate::rpc::{RpcError, ToolOutcome};
    use async_trait::async_trait;
    use base64::Engine as _;
    use std::sync::Arc;
    use std::time::Duration;

    fn schema(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({"type": "object"}),
        }
    }

    #[test]
    fn screenshot_tool_preference_order() {
        let tools = vec![
            schema("take_screenshot"),
            schema("capture_viewport"),
            schema("get_viewport_screenshot"),
        ];
        assert_eq!(screenshot_tool(&tools), Some("get_viewport_screenshot"));

        let tools = vec![schema("take_screenshot"), schema("capture_viewport")];
        assert_eq!(screenshot_tool(&tools), Some("capture_viewport"));

        let tools = vec![schema("grab_screenshot_now")];
        assert_eq!(screenshot_tool(&tools), Some("grab_screenshot_now"));

        assert_eq!(screenshot_tool(&[schema("get_scene_info")]), None);
    }

    #[test]
    fn artifact_names() {
        assert_eq!(artifact_name(3, 0, 0), "step_003.png");
        assert_eq!(artifact_name(3, 2, 0), "step_003_refine2.png");
        assert_eq!(artifact_name(3, 2, 1), "step_003_refine2_1.png");
    }

    struct ScoringVision(&'static str);

    #[async_trait]
    impl LlmClient for ScoringVision {
        async fn chat(
            &self,
            _model: &str,
            _system: Option<&str>,
            _messages: &[ChatMessage],
            _tools: Option<&[ToolDefinition]>,
            _options: ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            Ok(ChatResponse {
                content: Some(self.0.to_string()),
                tool_uses: vec![],
                stop_reason: Some("end_turn".to_string()),
                usage: None,
            })
        }
    }

    struct ScreenshotOnly;

    #[async_trait]
    impl ToolClient for ScreenshotOnly {
        async fn list_tools(&self) -> Result<Vec<ToolSchema>, RpcError> {
            Ok(vec![schema("get_viewport_screenshot")])
        }

        async fn call_tool(
            &self,
            _name: &str,
            _params: serde_json::Value,
        ) -> Result<ToolOutcome, RpcError> {
            Ok(ToolOutcome {
                success: true,
                result: "captured".to_string(),
                image_data: Some(base64::engine::general_purpose::STANDARD.encode(b"png-bytes")),
                mime_type: Some("image/png".to_string()),
            })
        }
    }

    fn vision(feedback: &'static str) -> VisionGateway {
        VisionGateway::new(
            Arc::new(ScoringVision(feedback)),
            "vision-model".to_string(),
            RateLimitConfig {
                max_retries: 0,
                base_wait: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn capture_persists_and_scores() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = FeedbackCapturer::new(
            vision("Good work so far. Quality: 78/100"),
            dir.path().to_path_buf(),
        );
        let tools = vec![schema("get_viewport_screenshot")];
        let goal = Goal::Brief {
            text: "a watchtower".to_string(),
        };

        let result = capturer
            .capture(&ScreenshotOnly, &tools, "deadbeef", &goal, None, 2, "Add roof", 0)
            .await
            .unwrap();

        assert_eq!(result.score, 78);
        assert!(result.artifact.ends_with("deadbeef/step_002.png"));
        assert_eq!(std::fs::read(&result.artifact).unwrap(), b"png-bytes");
        assert_eq!(result.record.artifact.as_deref(), Some(result.artifact.as_path()));
    }

    #[tokio::test]
    async fn refinement_attempts_get_distinct_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let capturer =
            FeedbackCapturer::new(vision("Rating: 55"), dir.path().to_path_buf());
        let tools = vec![schema("get_viewport_screenshot")];
        let goal = Goal::Brief {
            text: "a watchtower".to_string(),
        };

        let first = capturer
            .capture(&ScreenshotOnly, &tools, "k", &goal, None, 1, "Tower body", 0)
            .await
            .unwrap();
        let second = capturer
            .capture(&ScreenshotOnly, &tools, "k", &goal, None, 1, "Tower body", 1)
            .await
            .unwrap();

        assert_ne!(first.artifact, second.artifact);
        assert!(second.artifact.to_string_lossy().contains("refine1"));
    }

    /// Records every tool call; screenshots return an image, the rest "ok".
    struct RecordingTools {
        calls: std::sync::Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl RecordingTools {
        fn new() -> Self {
            Self {
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolClient for RecordingTools {
        async fn list_tools(&self) -> Result<Vec<ToolSchema>, RpcError> {
            Ok(vec![])
        }

        async fn call_tool(
            &self,
            name: &str,
            params: serde_json::Value,
        ) -> Result<ToolOutcome, RpcError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), params));
            if name == "get_viewport_screenshot" {
                Ok(ToolOutcome {
                    success: true,
                    result: "captured".to_string(),
                    image_data: Some(
                        base64::engine::general_purpose::STANDARD.encode(b"png-bytes"),
                    ),
                    mime_type: Some("image/png".to_string()),
                })
            } else {
                Ok(ToolOutcome {
                    success: true,
                    result: "ok".to_string(),
                    image_data: None,
                    mime_type: None,
                })
            }
        }
    }

    #[tokio::test]
    async fn code_tool_frames_viewport_before_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = FeedbackCapturer::new(vision("Quality: 70/100"), dir.path().to_path_buf());
        let tools = vec![
            schema("execute_blender_code"),
            schema("get_viewport_screenshot"),
        ];
        let goal = Goal::Brief {
            text: "a watchtower".to_string(),
        };
        let recorder = RecordingTools::new();

        capturer
            .capture(&recorder, &tools, "k", &goal, None, 0, "Base", 0)
            .await
            .unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls[0].0, "execute_blender_code");
        let code = calls[0].1["code"].as_str().unwrap();
        assert!(code.contains("view3d.view_all"));
        assert_eq!(calls[1].0, "get_viewport_screenshot");
    }

    #[tokio::test]
    async fn missing_screenshot_tool_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let capturer = FeedbackCapturer::new(vision("n/a"), dir.path().to_path_buf());
        let goal = Goal::Brief {
            text: "anything".to_string(),
        };
        let err = capturer
            .capture(&ScreenshotOnly, &[schema("get_scene_info")], "k", &goal, None, 0, "x", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MissingTool(_)));
    }
}
