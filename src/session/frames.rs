use crate::runtime::inspect::StackFrame;
use crate::runtime::Position;

/// Frame presented to a client, path is the debuggee one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub name: String,
    pub file: String,
    pub line: u32,
}

/// Combine current position (`.`) and call stack (`T`) into a list of frames.
///
/// `T` describes call sites: element `k` is the sub of frame `k` called from the position
/// of frame `k + 1`. The outermost frame has no `T` element and is the main program.
pub fn build_frames(position: Option<&Position>, trace: &[StackFrame]) -> Vec<FrameInfo> {
    let mut frames = vec![];

    if let Some(position) = position {
        frames.push(FrameInfo {
            name: position.sub.clone(),
            file: position.file.clone(),
            line: position.line,
        });
    }

    for (k, call) in trace.iter().enumerate() {
        let name = trace
            .get(k + 1)
            .map(|caller| caller.sub_name().to_string())
            .unwrap_or_else(|| "main".to_string());
        frames.push(FrameInfo {
            name,
            file: call.file.clone(),
            line: call.line,
        });
    }

    frames
}

#[cfg(test)]
mod test {
    use super::*;

    fn call(index: usize, sub: &str, file: &str, line: u32) -> StackFrame {
        StackFrame {
            index,
            sub: sub.to_string(),
            file: file.to_string(),
            line,
        }
    }

    #[test]
    fn test_build_frames() {
        let position = Position {
            sub: "main::inner".to_string(),
            file: "t.pl".to_string(),
            line: 3,
        };
        let trace = vec![
            call(0, "main::inner(1)", "t.pl", 8),
            call(1, "main::outer()", "t.pl", 12),
        ];

        let frames = build_frames(Some(&position), &trace);
        let names: Vec<_> = frames.iter().map(|f| f.name.as_str()).collect();
        let lines: Vec<_> = frames.iter().map(|f| f.line).collect();
        assert_eq!(names, vec!["main::inner", "main::outer", "main"]);
        assert_eq!(lines, vec![3, 8, 12]);
    }

    #[test]
    fn test_top_level_frame() {
        let position = Position {
            sub: "main".to_string(),
            file: "t.pl".to_string(),
            line: 1,
        };
        assert_eq!(
            build_frames(Some(&position), &[]),
            vec![FrameInfo {
                name: "main".to_string(),
                file: "t.pl".to_string(),
                line: 1
            }]
        );
        assert!(build_frames(None, &[]).is_empty());
    }
}
