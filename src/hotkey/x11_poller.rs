// 该文件是 Tuzhi （图志） 项目的一部分。
// src/hotkey/x11_poller.rs - 轮询 X11 键盘状态
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

//! 用 QueryKeymap 轮询而不是抓取按键，游戏仍能收到同一个按键。

use std::time::Duration;

use tracing::{debug, info};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;

use crate::{
  hotkey::{EdgeDetector, HotkeyDispatcher, HotkeyError, HotkeyEvent, KeyBindings},
  task::Shutdown,
};

fn display_error<E: std::fmt::Display>(err: E) -> HotkeyError {
  HotkeyError::Display(err.to_string())
}

pub struct X11KeyPoller {
  conn: RustConnection,
  detector: EdgeDetector,
}

/// 在键盘映射表中找出产生 `keysym` 的第一个 keycode
fn find_keycode(min_keycode: u8, keysyms_per_keycode: u8, keysyms: &[u32], keysym: u32) -> Option<u8> {
  let per = keysyms_per_keycode.max(1) as usize;
  keysyms
    .chunks(per)
    .position(|row| row.contains(&keysym))
    .and_then(|i| u8::try_from(min_keycode as usize + i).ok())
}

impl X11KeyPoller {
  pub fn new(bindings: &KeyBindings) -> Result<Self, HotkeyError> {
    let (conn, _) = x11rb::connect(None).map_err(display_error)?;

    let setup = conn.setup();
    let (min_keycode, max_keycode) = (setup.min_keycode, setup.max_keycode);
    let mapping = conn
      .get_keyboard_mapping(min_keycode, max_keycode - min_keycode + 1)
      .map_err(display_error)?
      .reply()
      .map_err(display_error)?;

    let mut watched = Vec::new();
    for (key, event) in bindings.iter() {
      let keycode = find_keycode(
        min_keycode,
        mapping.keysyms_per_keycode,
        &mapping.keysyms,
        key.keysym(),
      )
      .ok_or(HotkeyError::Unmapped(*key))?;
      info!("热键 {} -> {:?} (keycode {})", key, event, keycode);
      watched.push((keycode, *event));
    }

    Ok(Self {
      conn,
      detector: EdgeDetector::new(watched),
    })
  }

  /// 一次轮询，返回本次新按下的热键
  pub fn poll(&mut self) -> Result<Vec<HotkeyEvent>, HotkeyError> {
    let reply = self
      .conn
      .query_keymap()
      .map_err(display_error)?
      .reply()
      .map_err(display_error)?;
    Ok(self.detector.update(&reply.keys))
  }

  /// 轮询直到退出键、Ctrl-C 或工作线程退出
  pub fn run(
    mut self,
    interval: Duration,
    dispatcher: &HotkeyDispatcher,
    shutdown: &Shutdown,
  ) -> Result<(), HotkeyError> {
    while !shutdown.is_triggered() {
      for event in self.poll()? {
        debug!("热键事件: {:?}", event);
        if dispatcher.dispatch(event).is_break() {
          return Ok(());
        }
      }
      std::thread::sleep(interval);
    }
    info!("热键监听结束");
    Ok(())
  }
}
