//! Scripted XPAD server for integration tests.
//!
//! Accepts any number of connections, greets each with the `> ` prompt and answers
//! commands from a shared [`ServerState`]. Exposures stream `frames` synthetic images
//! in direct mode, or write them as frame files in file mode. `DigitalTest` answers
//! with one [`test_pattern`] image.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const ROWS: u32 = 2;
pub const COLUMNS: u32 = 3;

/// Behaviour and command log shared by all connections.
#[derive(Debug)]
pub struct ServerState {
    /// Commands received, tagged with the connection index.
    pub commands: Vec<(usize, String)>,
    pub frames: u32,
    pub frame_delay: Duration,
    pub status: String,
    pub init_code: i64,
    pub aborted: bool,
    /// Set while `StartExposure` is being served; aborts outside it are ignored.
    pub exposing: bool,
    pub output_path: Option<PathBuf>,
    pub direct: bool,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            frames: 0,
            frame_delay: Duration::ZERO,
            status: "Idle".to_string(),
            init_code: 0,
            aborted: false,
            exposing: false,
            output_path: None,
            direct: true,
        }
    }
}

pub struct FakeXpadServer {
    pub port: u16,
    pub state: Arc<Mutex<ServerState>>,
    accept: JoinHandle<()>,
}

impl FakeXpadServer {
    pub async fn start(state: ServerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(state));

        let shared = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            let mut index = 0;
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, index, Arc::clone(&shared)));
                index += 1;
            }
        });

        Self {
            port,
            state,
            accept,
        }
    }

    /// Commands received on connection `index`, in order.
    pub fn commands_on(&self, index: usize) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn set_status(&self, status: &str) {
        self.state.lock().status = status.to_string();
    }
}

impl Drop for FakeXpadServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

/// Pixel value of `(frame, index)` in synthetic images.
pub fn pixel(frame: u32, index: u32) -> u32 {
    frame * 100 + index
}

/// Pixel value of the `DigitalTest` image.
pub fn test_pattern(index: u32) -> u32 {
    0xA000 + index
}

fn image(frame: u32) -> Vec<u8> {
    (0..ROWS * COLUMNS)
        .flat_map(|i| pixel(frame, i).to_le_bytes())
        .collect()
}

async fn send_frame(reader: &mut BufReader<TcpStream>, payload: &[u8]) -> std::io::Result<()> {
    let stream = reader.get_mut();
    stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    stream.write_all(&ROWS.to_le_bytes()).await?;
    stream.write_all(&COLUMNS.to_le_bytes()).await?;
    stream.write_all(payload).await?;

    let mut ack = [0u8; 1];
    reader.read_exact(&mut ack).await?;
    assert_eq!(ack[0], b'\n');
    Ok(())
}

async fn serve(stream: TcpStream, index: usize, state: Arc<Mutex<ServerState>>) {
    let mut reader = BufReader::new(stream);
    if reader.get_mut().write_all(b"> ").await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        // Acknowledgements of a missing frame arrive as blank lines.
        if command.is_empty() {
            continue;
        }
        state.lock().commands.push((index, command.clone()));

        let name = command.split_whitespace().next().unwrap_or_default();
        let reply = match name {
            "Exit" => return,
            "AbortCurrentProcess" => {
                let mut s = state.lock();
                if s.exposing {
                    s.aborted = true;
                }
                continue;
            }
            "DigitalTest" => {
                let payload: Vec<u8> = (0..ROWS * COLUMNS)
                    .flat_map(|i| test_pattern(i).to_le_bytes())
                    .collect();
                if send_frame(&mut reader, &payload).await.is_err() {
                    return;
                }
                "*0\n".to_string()
            }
            "StartExposure" => {
                if exposure(&mut reader, &state).await.is_err() {
                    return;
                }
                continue;
            }
            "SetExposureParameters" => {
                let fields: Vec<&str> = command.split_whitespace().collect();
                let mut s = state.lock();
                s.direct = fields.get(9) == Some(&"1");
                s.output_path = fields.last().map(PathBuf::from);
                "*0\n".to_string()
            }
            "Init" => format!("*{}\n", state.lock().init_code),
            "GetDetectorType" => "*\"XPAD_S70\"\n".to_string(),
            "GetDetectorModel" => "*\"S70\"\n".to_string(),
            "GetModuleMask" => "*1\n".to_string(),
            "GetChipMask" => "*127\n".to_string(),
            "GetModuleNumber" => "*1\n".to_string(),
            "GetChipNumber" => "*7\n".to_string(),
            "GetBurstNumber" => "*0\n".to_string(),
            "GetImageSize" => format!("*\"{ROWS}x{COLUMNS}\"\n"),
            "GetDetectorStatus" => format!("*\"{}\"\n", state.lock().status),
            "GetWhiteImagesInDir" => "*-1\n*\"white_a white_b\"\n".to_string(),
            "Bogus" => "!unknown command\n> ".to_string(),
            _ => "*0\n".to_string(),
        };
        if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn exposure(
    reader: &mut BufReader<TcpStream>,
    state: &Arc<Mutex<ServerState>>,
) -> std::io::Result<()> {
    let (frames, delay, direct, output_path) = {
        let mut s = state.lock();
        s.exposing = true;
        (s.frames, s.frame_delay, s.direct, s.output_path.clone())
    };

    let mut aborted = false;
    for frame in 0..frames {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if state.lock().aborted {
            aborted = true;
            break;
        }

        if direct {
            send_frame(reader, &image(frame)).await?;
        } else if let Some(dir) = &output_path {
            let path = dir.join(format!("burst_0_image_{frame}.bin"));
            tokio::fs::write(path, image(frame)).await?;
        }
    }

    let code = if aborted { 1 } else { 0 };
    {
        let mut s = state.lock();
        s.aborted = false;
        s.exposing = false;
    }
    reader
        .get_mut()
        .write_all(format!("*{code}\n").as_bytes())
        .await
}
