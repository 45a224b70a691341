//! Request and response handlers, and the table that binds them to codes.

mod database;
mod frame;
mod message;
mod notification;
mod session;
mod transaction;

use bytes::Bytes;

use crate::handler::HandlerRegistry;
use crate::protocol::{cstr_list, ErrorCode, NotificationCode, PayloadReader, RequestCode};

/// Longest message body accepted by the messaging requests.
pub const MAX_MESSAGE_LEN: usize = 255;

/// Build the server's dispatch table.
///
/// The second column is the shortest payload each request accepts.
pub fn build_registry() -> HandlerRegistry {
    use RequestCode::*;

    let mut r = HandlerRegistry::new();

    r.register_request(Identify, 0, session::identify);
    r.register_request(Register, 6, session::register);
    r.register_request(Unregister, 0, session::unregister);
    r.register_request(FindClients, 0, session::find_clients);
    r.register_request(GetPreferences, 0, session::get_preferences);
    r.register_request(SetPreferences, 0, session::set_preferences);
    r.register_request(ServerStatistics, 0, session::statistics);
    r.register_request(LivenessCheck, 0, session::liveness);
    r.register_request(GetSystemConfig, 1, session::get_system_config);
    r.register_request(SetSystemConfig, 2, session::set_system_config);
    r.register_request(GetUserData, 1, session::get_user_data);
    r.register_request(SetUserData, 1, session::set_user_data);

    r.register_request(ListDatabases, 0, database::list);
    r.register_request(GetIndexInfo, 2, database::index_info);
    r.register_request(OpenDatabase, 2, database::open);
    r.register_request(CreateDatabase, 2, database::create);
    r.register_request(CloseDatabase, 2, database::close);
    r.register_request(CreateIndex, 3, database::create_index);
    r.register_request(GetDbIndex, 2, database::db_index);
    r.register_request(IndexedRetrieval, 5, database::indexed_retrieval);

    r.register_request(GetFrame, 3, frame::get);
    r.register_request(GetOldFrame, 3, frame::get_old);
    r.register_request(GetFillers, 5, frame::get_fillers);
    r.register_request(LockFrame, 3, frame::lock);
    r.register_request(UnlockFrame, 3, frame::unlock);
    r.register_request(CreateFrame, 3, frame::create);
    r.register_request(DeleteFrame, 3, frame::delete);
    r.register_request(RevertFrame, 3, frame::revert);
    r.register_request(UpdateFrame, 3, frame::update);
    r.register_request(TestAncestry, 5, frame::test_ancestry);
    r.register_request(CheckRestrictions, 5, frame::check_restrictions);
    r.register_request(ProxyUpdate, 7, frame::proxy_update);
    r.register_request(InheritableFacets, 4, frame::inheritable_facets);
    r.register_request(InheritAllFillers, 6, frame::inherit_all_fillers);

    r.register_request(BeginTransaction, 2, transaction::begin);
    r.register_request(EndTransaction, 6, transaction::end);
    r.register_request(AbortTransaction, 6, transaction::abort);

    r.register_request(RequestCode::PersonalMessage, 2, message::personal);
    r.register_request(RequestCode::BroadcastMessage, 1, message::broadcast);
    r.register_request(RequestCode::ClientMessage, 4, message::client);

    for &code in NotificationCode::ALL {
        r.register_response(code, notification::response);
    }

    r
}

fn bool_reply(value: bool) -> Bytes {
    Bytes::copy_from_slice(&[u8::from(value)])
}

fn names_reply(names: &[String]) -> Bytes {
    cstr_list(names.iter().map(String::as_str))
}

/// A required string argument; empty is as bad as missing.
fn required<'a>(reader: &mut PayloadReader<'a>) -> Result<&'a str, ErrorCode> {
    match reader.cstr()? {
        "" => Err(ErrorCode::InvalidParameters),
        s => Ok(s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_every_code() {
        let registry = build_registry();
        for &code in RequestCode::ALL {
            assert!(registry.contains(code.as_wire()), "{}", code.name());
        }
        for &code in NotificationCode::ALL {
            assert!(registry.contains(code.as_wire()), "{}", code.name());
        }
        assert_eq!(
            registry.len(),
            RequestCode::ALL.len() + NotificationCode::ALL.len()
        );
    }

    #[test]
    fn test_minimum_lengths() {
        let registry = build_registry();
        let expect = [
            (RequestCode::Register, 6),
            (RequestCode::OpenDatabase, 2),
            (RequestCode::GetFillers, 5),
            (RequestCode::EndTransaction, 6),
            (RequestCode::ProxyUpdate, 7),
            (RequestCode::InheritAllFillers, 6),
            (RequestCode::LivenessCheck, 0),
        ];
        for (code, min) in expect {
            assert_eq!(registry.min_len(code.as_wire()), Some(min), "{}", code.name());
        }
    }
}
